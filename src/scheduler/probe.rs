use crate::error::{FleetError, Result};
use crate::models::{Job, NodeAdvertisement, SelectionPolicy};

/// An admission predicate declared in a job's selection policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Node must have reported a successful POST of the job to this URL
    Http(String),
    /// Node must have reported this command exiting 0 for the job
    Exec(String),
}

impl Probe {
    /// Parse the probes of a policy. A malformed probe makes the policy
    /// unusable, which is a permanent failure.
    pub fn from_policy(policy: &SelectionPolicy) -> Result<Vec<Probe>> {
        let mut probes = Vec::new();
        if let Some(url) = &policy.probe_http {
            let url = url.trim();
            let scheme_ok = url.starts_with("http://") || url.starts_with("https://");
            let has_host = url
                .split_once("://")
                .is_some_and(|(_, rest)| !rest.is_empty());
            if !scheme_ok || !has_host {
                return Err(FleetError::InvalidSelectionPolicy(format!(
                    "http probe must be an http(s) URL, got {url:?}"
                )));
            }
            probes.push(Probe::Http(url.to_string()));
        }
        if let Some(command) = &policy.probe_exec {
            let command = command.trim();
            if command.is_empty() {
                return Err(FleetError::InvalidSelectionPolicy(
                    "exec probe must not be empty".to_string(),
                ));
            }
            probes.push(Probe::Exec(command.to_string()));
        }
        Ok(probes)
    }

    pub fn key(&self) -> &str {
        match self {
            Probe::Http(url) => url,
            Probe::Exec(command) => command,
        }
    }
}

/// Decides whether a node satisfies a probe. Must not block: the planner
/// calls it inline for every candidate.
pub trait ProbeChecker: Send + Sync {
    fn admits(&self, probe: &Probe, job: &Job, node: &NodeAdvertisement) -> bool;
}

/// Trusts the probe results nodes publish in their heartbeats.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdvertisedProbes;

impl ProbeChecker for AdvertisedProbes {
    fn admits(&self, probe: &Probe, _job: &Job, node: &NodeAdvertisement) -> bool {
        node.info.passed_probes.contains(probe.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_probes() {
        let policy = SelectionPolicy {
            probe_http: Some("https://probe.local/check".into()),
            probe_exec: Some("test -d /data".into()),
            ..Default::default()
        };
        let probes = Probe::from_policy(&policy).unwrap();
        assert_eq!(
            probes,
            vec![
                Probe::Http("https://probe.local/check".into()),
                Probe::Exec("test -d /data".into())
            ]
        );
    }

    #[test]
    fn rejects_malformed_probes() {
        let bad_http = SelectionPolicy {
            probe_http: Some("ftp://nope".into()),
            ..Default::default()
        };
        assert!(Probe::from_policy(&bad_http).is_err());

        let empty_host = SelectionPolicy {
            probe_http: Some("http://".into()),
            ..Default::default()
        };
        assert!(Probe::from_policy(&empty_host).is_err());

        let blank_exec = SelectionPolicy {
            probe_exec: Some("   ".into()),
            ..Default::default()
        };
        assert!(Probe::from_policy(&blank_exec).is_err());
    }

    #[test]
    fn no_probes_by_default() {
        assert!(Probe::from_policy(&SelectionPolicy::default())
            .unwrap()
            .is_empty());
    }
}
