//! Run configuration and per-kind target resolution

use std::path::PathBuf;

use enum_map::EnumMap;

use crate::account::{AccountRef, ConnectionString, Kind};
use crate::adapter::{PlaneSettings, Target};
use crate::credential::AuthSettings;
use crate::error::Error;
use crate::orchestrator::OrchestratorSettings;
use crate::retry::RetryPolicy;

/// Identifiers and policy for one kind, as given on the command line or in the environment.
#[derive(Clone, Debug, Default)]
pub struct KindSettings {
    pub source: Option<String>,
    pub destination: Option<String>,
    /// Only honored for file shares.
    pub source_connection_string: Option<String>,
    pub destination_connection_string: Option<String>,
    pub overwrite: bool,
    /// Replicate only this resource instead of every resource of the kind.
    pub resource_name: Option<String>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

impl KindSettings {
    /// Whether any account identifier or connection string is set.
    pub fn is_configured(&self) -> bool {
        [
            &self.source,
            &self.destination,
            &self.source_connection_string,
            &self.destination_connection_string,
        ]
        .into_iter()
        .any(|value| present(value).is_some())
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub auth: AuthSettings,
    pub kinds: EnumMap<Kind, KindSettings>,
    /// Kinds to replicate; empty means every configured kind.
    pub requested: Vec<Kind>,
    pub retry: RetryPolicy,
    pub call_timeout: std::time::Duration,
    pub orchestrator: OrchestratorSettings,
    pub stream_copy_threshold: u64,
    pub queue_visibility_timeout: std::time::Duration,
    pub azcopy: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auth: AuthSettings::default(),
            kinds: EnumMap::default(),
            requested: Vec::new(),
            retry: RetryPolicy::default(),
            call_timeout: std::time::Duration::from_secs(60),
            orchestrator: OrchestratorSettings::default(),
            stream_copy_threshold: 32 * 1024 * 1024,
            queue_visibility_timeout: std::time::Duration::from_secs(600),
            azcopy: PathBuf::from("azcopy"),
        }
    }
}

/// A kind with both of its targets resolved.
#[derive(Clone, Debug)]
pub struct KindPlan {
    pub kind: Kind,
    pub source: Target,
    pub destination: Target,
    pub overwrite: bool,
    pub resource_name: Option<String>,
}

/// The outcome of checking every requested kind.
#[derive(Debug, Default)]
pub struct Resolved {
    pub runnable: Vec<KindPlan>,
    /// Requested kinds that cannot run; other kinds proceed.
    pub misconfigured: Vec<(Kind, Error)>,
}

impl Resolved {
    pub fn needs_credential(&self) -> bool {
        self.runnable
            .iter()
            .any(|plan| plan.source.needs_credential() || plan.destination.needs_credential())
    }
}

fn target(
    kind: Kind,
    side: &str,
    account: Option<&str>,
    connection_string: Option<&str>,
) -> Result<Target, Error> {
    match (connection_string, account) {
        (Some(connection_string), _) if kind == Kind::FileShare => {
            ConnectionString::parse(connection_string).map(Target::ConnectionString)
        }
        (_, Some(account)) => AccountRef::parse(account, kind).map(Target::Account),
        _ => Err(Error::configuration(
            kind,
            format!("no {side} account configured"),
        )),
    }
}

impl Settings {
    pub fn requested_kinds(&self) -> Vec<Kind> {
        if self.requested.is_empty() {
            Kind::ALL
                .into_iter()
                .filter(|kind| self.kinds[*kind].is_configured())
                .collect()
        } else {
            let mut kinds = self.requested.clone();
            kinds.sort();
            kinds.dedup();
            kinds
        }
    }

    /// Resolves every requested kind; fails only when none of them can run.
    pub fn resolve(&self) -> Result<Resolved, Error> {
        let mut resolved = Resolved::default();
        for kind in self.requested_kinds() {
            let settings = &self.kinds[kind];
            let plan = target(
                kind,
                "source",
                present(&settings.source),
                present(&settings.source_connection_string),
            )
            .and_then(|source| {
                let destination = target(
                    kind,
                    "destination",
                    present(&settings.destination),
                    present(&settings.destination_connection_string),
                )?;
                Ok(KindPlan {
                    kind,
                    source,
                    destination,
                    overwrite: settings.overwrite,
                    resource_name: present(&settings.resource_name).map(str::to_string),
                })
            });
            match plan {
                Ok(plan) => resolved.runnable.push(plan),
                Err(error) => {
                    tracing::error!("{error}");
                    resolved.misconfigured.push((kind, error));
                }
            }
        }
        if resolved.runnable.is_empty() {
            let reason = if resolved.misconfigured.is_empty() {
                "no storage kind is configured".to_string()
            } else {
                resolved
                    .misconfigured
                    .iter()
                    .map(|(_, error)| error.to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            return Err(Error::Configuration { kind: None, reason });
        }
        Ok(resolved)
    }

    pub fn plane_settings(&self) -> PlaneSettings {
        PlaneSettings {
            call_timeout: self.call_timeout,
            queue_visibility_timeout: self.queue_visibility_timeout,
        }
    }
}
