//! # Queue Selectors
//!
//! Predicates partitioning the shared job queue by location, task or job.
//! Evaluated in memory by the in-memory transport and rendered into a SQL
//! `WHERE` fragment by the PostgreSQL transport.

use sqlx::{Postgres, QueryBuilder};
use std::fmt;
use uuid::Uuid;

use super::JobMessage;
use crate::models::TaskId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Any,
    Location(String),
    LocationIn(Vec<String>),
    Task(TaskId),
    JobId(Uuid),
    And(Box<Selector>, Box<Selector>),
    Or(Box<Selector>, Box<Selector>),
    Not(Box<Selector>),
}

impl Selector {
    pub fn location(location: impl Into<String>) -> Self {
        Self::Location(location.into())
    }

    pub fn locations<I, S>(locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut locations: Vec<String> = locations.into_iter().map(Into::into).collect();
        if locations.len() == 1 {
            return Self::Location(locations.remove(0));
        }
        Self::LocationIn(locations)
    }

    pub fn task(task_id: TaskId) -> Self {
        Self::Task(task_id)
    }

    pub fn job(job_id: Uuid) -> Self {
        Self::JobId(job_id)
    }

    pub fn and(self, other: Selector) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Selector) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn matches(&self, message: &JobMessage) -> bool {
        match self {
            Self::Any => true,
            Self::Location(location) => message.location == *location,
            Self::LocationIn(locations) => locations.iter().any(|l| *l == message.location),
            Self::Task(task_id) => message.task_id == *task_id,
            Self::JobId(job_id) => message.job_id == *job_id,
            Self::And(a, b) => a.matches(message) && b.matches(message),
            Self::Or(a, b) => a.matches(message) || b.matches(message),
            Self::Not(inner) => !inner.matches(message),
        }
    }

    /// Append this selector as a bound SQL predicate over the queue table
    pub fn push_sql(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Self::Any => {
                builder.push("TRUE");
            }
            Self::Location(location) => {
                builder.push("location = ").push_bind(location.clone());
            }
            Self::LocationIn(locations) => {
                builder
                    .push("location = ANY(")
                    .push_bind(locations.clone())
                    .push(")");
            }
            Self::Task(task_id) => {
                builder.push("task_id = ").push_bind(task_id.to_string());
            }
            Self::JobId(job_id) => {
                builder.push("job_id = ").push_bind(*job_id);
            }
            Self::And(a, b) => {
                builder.push("(");
                a.push_sql(builder);
                builder.push(" AND ");
                b.push_sql(builder);
                builder.push(")");
            }
            Self::Or(a, b) => {
                builder.push("(");
                a.push_sql(builder);
                builder.push(" OR ");
                b.push_sql(builder);
                builder.push(")");
            }
            Self::Not(inner) => {
                builder.push("NOT (");
                inner.push_sql(builder);
                builder.push(")");
            }
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("TRUE"),
            Self::Location(location) => write!(f, "location = '{location}'"),
            Self::LocationIn(locations) => {
                let quoted: Vec<String> = locations.iter().map(|l| format!("'{l}'")).collect();
                write!(f, "location IN ({})", quoted.join(", "))
            }
            Self::Task(task_id) => write!(f, "task_id = '{task_id}'"),
            Self::JobId(job_id) => write!(f, "job_id = '{job_id}'"),
            Self::And(a, b) => write!(f, "({a} AND {b})"),
            Self::Or(a, b) => write!(f, "({a} OR {b})"),
            Self::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}
