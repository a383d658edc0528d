//! # Cluster Settings Resolution
//!
//! Picks the cluster server and queue for a job from the ordered server
//! settings (the first is the default), the task factory's overrides and the
//! overrides a user put in the job's parameter group.

use std::collections::BTreeMap;

use super::ClusterError;
use crate::config::ClusterSettings;
use crate::constants::parameters;
use crate::pipeline::ResourceOverrides;

/// Overrides read from a job's parameter group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobClusterOverrides {
    pub queue: Option<String>,
    pub location: Option<String>,
    pub max_cpu_time_minutes: Option<u32>,
    pub max_wall_time_minutes: Option<u32>,
    pub max_time_minutes: Option<u32>,
    pub max_memory_mb: Option<u64>,
}

impl JobClusterOverrides {
    /// Parse `"<group>, cluster ..."` parameters; no group means no overrides
    pub fn from_parameters(
        params: &BTreeMap<String, String>,
        group: Option<&str>,
    ) -> Result<Self, ClusterError> {
        let Some(group) = group else {
            return Ok(Self::default());
        };
        let text = |name: &str| {
            params
                .get(&parameters::grouped(group, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Ok(Self {
            queue: text(parameters::CLUSTER_QUEUE),
            location: text(parameters::CLUSTER_LOCATION),
            max_cpu_time_minutes: parse_number(group, parameters::CLUSTER_MAX_CPU_TIME, text(parameters::CLUSTER_MAX_CPU_TIME))?,
            max_wall_time_minutes: parse_number(group, parameters::CLUSTER_MAX_WALL_TIME, text(parameters::CLUSTER_MAX_WALL_TIME))?,
            max_time_minutes: parse_number(group, parameters::CLUSTER_MAX_TIME, text(parameters::CLUSTER_MAX_TIME))?,
            max_memory_mb: parse_number(group, parameters::CLUSTER_MAX_MEMORY, text(parameters::CLUSTER_MAX_MEMORY))?,
        })
    }
}

fn parse_number<T: std::str::FromStr>(
    group: &str,
    name: &str,
    value: Option<String>,
) -> Result<Option<T>, ClusterError> {
    value
        .map(|v| {
            v.parse::<T>()
                .map_err(|_| ClusterError::invalid_parameter(parameters::grouped(group, name), v))
        })
        .transpose()
}

/// Final settings a cluster submission uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClusterSettings {
    pub location: String,
    pub endpoint: String,
    pub queue: Option<String>,
    pub max_cpu_time_minutes: Option<u32>,
    pub max_wall_time_minutes: Option<u32>,
    pub max_time_minutes: Option<u32>,
    pub max_memory_mb: Option<u64>,
    pub termination_time_minutes: Option<u32>,
}

impl ResolvedClusterSettings {
    fn from_setting(setting: &ClusterSettings) -> Self {
        Self {
            location: setting.location.clone(),
            endpoint: setting.endpoint.clone(),
            queue: setting.queue.clone(),
            max_cpu_time_minutes: setting.max_cpu_time_minutes,
            max_wall_time_minutes: setting.max_wall_time_minutes,
            max_time_minutes: setting.max_time_minutes,
            max_memory_mb: setting.max_memory_mb,
            termination_time_minutes: setting.termination_time_minutes,
        }
    }

    fn merge_factory(&mut self, overrides: &ResourceOverrides) {
        if overrides.queue.is_some() {
            self.queue = overrides.queue.clone();
        }
        self.max_cpu_time_minutes = overrides.max_cpu_time_minutes.or(self.max_cpu_time_minutes);
        self.max_wall_time_minutes = overrides.max_wall_time_minutes.or(self.max_wall_time_minutes);
        self.max_time_minutes = overrides.max_time_minutes.or(self.max_time_minutes);
        self.max_memory_mb = overrides.max_memory_mb.or(self.max_memory_mb);
    }

    fn merge_job(&mut self, overrides: &JobClusterOverrides) {
        if overrides.queue.is_some() {
            self.queue = overrides.queue.clone();
        }
        self.max_cpu_time_minutes = overrides.max_cpu_time_minutes.or(self.max_cpu_time_minutes);
        self.max_wall_time_minutes = overrides.max_wall_time_minutes.or(self.max_wall_time_minutes);
        self.max_time_minutes = overrides.max_time_minutes.or(self.max_time_minutes);
        self.max_memory_mb = overrides.max_memory_mb.or(self.max_memory_mb);
    }
}

/// Choose and merge the settings for one submission
pub fn resolve_cluster_settings(
    settings: &[ClusterSettings],
    factory: &ResourceOverrides,
    job: &JobClusterOverrides,
) -> Result<ResolvedClusterSettings, ClusterError> {
    let default = settings.first().ok_or(ClusterError::NoSettings)?;

    let chosen = match &job.queue {
        Some(queue) => match setting_for_queue(settings, queue, job.location.as_deref())? {
            Some(setting) => setting,
            None => setting_for_location(settings, default, factory, job)?,
        },
        None => setting_for_location(settings, default, factory, job)?,
    };

    let mut resolved = ResolvedClusterSettings::from_setting(chosen);
    resolved.merge_factory(factory);
    resolved.merge_job(job);
    if resolved.queue.is_none() {
        resolved.queue = chosen.available_queues.first().cloned();
    }
    Ok(resolved)
}

fn matches_location(setting: &ClusterSettings, location: Option<&str>) -> bool {
    location.map_or(true, |l| setting.location.eq_ignore_ascii_case(l))
}

fn setting_for_queue<'a>(
    settings: &'a [ClusterSettings],
    queue: &str,
    location: Option<&str>,
) -> Result<Option<&'a ClusterSettings>, ClusterError> {
    let mut found: Option<&ClusterSettings> = None;
    for (index, setting) in settings.iter().enumerate() {
        if !setting.available_queues.iter().any(|q| q == queue) || !matches_location(setting, location) {
            continue;
        }
        if index == 0 {
            return Ok(Some(setting));
        }
        if found.is_some() {
            return Err(ClusterError::ambiguous_queue(queue));
        }
        found = Some(setting);
    }
    Ok(found)
}

fn setting_for_location<'a>(
    settings: &'a [ClusterSettings],
    default: &'a ClusterSettings,
    factory: &ResourceOverrides,
    job: &JobClusterOverrides,
) -> Result<&'a ClusterSettings, ClusterError> {
    let Some(location) = job.location.as_deref().or(factory.location.as_deref()) else {
        return Ok(default);
    };
    settings
        .iter()
        .find(|s| s.location.eq_ignore_ascii_case(location))
        .ok_or_else(|| ClusterError::unknown_location(location))
}
