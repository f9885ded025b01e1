//! Deciding where an interrupted pull continues.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::model::Metadata;

/// Last recorded position of a paginated pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub endpoint: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub last_page: u32,
    pub count: u64,
}

impl ResumeState {
    pub fn is_empty(&self) -> bool {
        self.endpoint.is_empty()
    }

    pub fn clear(&mut self) {
        *self = ResumeState::default();
    }

    /// Endpoint and metadata both equal the request. Map equality ignores
    /// insertion order and an absent map equals an empty one.
    pub fn matches(&self, endpoint: &str, metadata: &Metadata) -> bool {
        !self.endpoint.is_empty() && self.endpoint == endpoint && &self.metadata == metadata
    }
}

/// Page and running count a fetch starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPoint {
    pub page: u32,
    pub count: u64,
}

impl StartPoint {
    pub const FIRST: StartPoint = StartPoint { page: 1, count: 0 };

    pub fn is_resumed(&self) -> bool {
        self.page > 1
    }
}

impl Default for StartPoint {
    fn default() -> Self {
        StartPoint::FIRST
    }
}

/// Options of one pull invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullOptions {
    /// Persist fetched rows to the local store.
    pub store: bool,
    /// Hand fetched rows back for printing.
    pub stdout: bool,
    /// Minimum pause between page requests.
    pub interval: Duration,
    pub resume: ResumeState,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            store: true,
            stdout: false,
            interval: Duration::ZERO,
            resume: ResumeState::default(),
        }
    }
}

impl PullOptions {
    /// Start point for `endpoint`/`metadata`.
    ///
    /// On a match the fetch continues after the recorded page and the
    /// returned options no longer carry the resume state, so a nested or
    /// later call cannot match it again.
    pub fn for_endpoint(&self, endpoint: &str, metadata: &Metadata) -> (PullOptions, StartPoint) {
        if !self.resume.matches(endpoint, metadata) {
            return (self.clone(), StartPoint::FIRST);
        }
        let start = StartPoint {
            page: self.resume.last_page.saturating_add(1).max(1),
            count: self.resume.count,
        };
        let mut options = self.clone();
        options.resume.clear();
        (options, start)
    }
}

/// Where an "every repository/team" driver restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumePosition {
    /// Position of the recorded candidate; `None` processes every candidate.
    pub index: Option<usize>,
    pub name: String,
    /// Informational note when stale resume metadata was discarded.
    pub message: Option<String>,
}

impl ResumePosition {
    /// Candidates strictly before the resume index were already processed.
    pub fn skips(&self, position: usize) -> bool {
        self.index.map_or(false, |index| position < index)
    }
}

/// Locates the candidate a driver should resume at.
///
/// `name_key` and `index_key` are the metadata keys recording the candidate's
/// name and list position, `label` names the candidate kind in messages and
/// `identifier` names the owner of the list.
pub fn prepare_resume(
    candidates: &[String],
    state: &mut ResumeState,
    endpoint: &str,
    name_key: &str,
    index_key: &str,
    label: &str,
    identifier: &str,
) -> ResumePosition {
    if state.endpoint != endpoint {
        return ResumePosition::default();
    }

    if let Some(name) = state.metadata.get(name_key).filter(|n| !n.is_empty()).cloned() {
        if let Some(index) = candidates.iter().position(|c| *c == name) {
            return ResumePosition {
                index: Some(index),
                name,
                message: None,
            };
        }
        state.clear();
        let message = format!(
            "resume {label} \"{name}\" for {identifier} not found in current list; restarting from first {label}"
        );
        info!(%endpoint, "{}", message);
        return ResumePosition {
            index: None,
            name: String::new(),
            message: Some(message),
        };
    }

    if state.metadata.contains_key(index_key) {
        state.clear();
        let message = format!(
            "resume state for {identifier} is missing the {label} name; restarting from first {label}"
        );
        info!(%endpoint, "{}", message);
        return ResumePosition {
            index: None,
            name: String::new(),
            message: Some(message),
        };
    }

    ResumePosition::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn options_with(resume: ResumeState) -> PullOptions {
        PullOptions {
            resume,
            ..PullOptions::default()
        }
    }

    fn candidates() -> Vec<String> {
        vec!["alpha".into(), "beta".into(), "gamma".into()]
    }

    fn state(metadata: Metadata) -> ResumeState {
        ResumeState {
            endpoint: "repos-users".into(),
            metadata,
            last_page: 2,
            count: 40,
        }
    }

    #[test]
    fn for_endpoint_resumes_on_exact_match() {
        let opts = options_with(ResumeState {
            endpoint: "repos-users".into(),
            metadata: meta(&[("repo", "r"), ("repo_index", "4")]),
            last_page: 3,
            count: 120,
        });
        let (next, start) =
            opts.for_endpoint("repos-users", &meta(&[("repo_index", "4"), ("repo", "r")]));
        assert_eq!(start, StartPoint { page: 4, count: 120 });
        assert!(next.resume.is_empty());
        // The cleared options no longer match.
        let (_, again) =
            next.for_endpoint("repos-users", &meta(&[("repo", "r"), ("repo_index", "4")]));
        assert_eq!(again, StartPoint::FIRST);
    }

    #[test]
    fn for_endpoint_starts_fresh_on_mismatch() {
        let opts = options_with(ResumeState {
            endpoint: "repos-users".into(),
            metadata: meta(&[("repo", "r")]),
            last_page: 3,
            count: 120,
        });
        let (next, start) = opts.for_endpoint("repos-teams", &meta(&[("repo", "r")]));
        assert_eq!(start, StartPoint::FIRST);
        assert_eq!(next, opts);

        let (_, start) = opts.for_endpoint("repos-users", &meta(&[("repo", "other")]));
        assert_eq!(start, StartPoint::FIRST);

        let (_, start) = opts.for_endpoint("repos-users", &Metadata::new());
        assert_eq!(start, StartPoint::FIRST);
    }

    #[test]
    fn for_endpoint_treats_missing_metadata_as_empty() {
        let resume: ResumeState =
            serde_json::from_str(r#"{"endpoint":"users","last_page":0,"count":0}"#).unwrap();
        let (_, start) = options_with(resume).for_endpoint("users", &Metadata::new());
        assert_eq!(start, StartPoint { page: 1, count: 0 });
    }

    #[test]
    fn for_endpoint_never_matches_empty_state() {
        let (_, start) = PullOptions::default().for_endpoint("", &Metadata::new());
        assert_eq!(start, StartPoint::FIRST);
    }

    #[test]
    fn prepare_resume_finds_recorded_candidate() {
        let mut st = state(meta(&[("repo", "beta"), ("repo_index", "1")]));
        let before = st.clone();
        let pos = prepare_resume(
            &candidates(), &mut st, "repos-users", "repo", "repo_index", "repository", "acme",
        );
        assert_eq!(pos.index, Some(1));
        assert_eq!(pos.name, "beta");
        assert!(pos.message.is_none());
        assert_eq!(st, before);
        assert!(pos.skips(0));
        assert!(!pos.skips(1));
        assert!(!pos.skips(2));
    }

    #[test]
    fn prepare_resume_clears_when_name_missing() {
        let mut st = state(meta(&[("repo_index", "2")]));
        let pos = prepare_resume(
            &candidates(), &mut st, "repos-users", "repo", "repo_index", "repository", "acme",
        );
        assert!(st.is_empty());
        assert_eq!(pos.index, None);
        assert!(pos.name.is_empty());
        assert!(pos.message.unwrap().contains("missing"));
    }

    #[test]
    fn prepare_resume_clears_when_name_not_found() {
        let mut st = state(meta(&[("repo", "delta")]));
        let pos = prepare_resume(
            &candidates(), &mut st, "repos-users", "repo", "repo_index", "repository", "acme",
        );
        assert!(st.is_empty());
        assert_eq!(pos.index, None);
        let message = pos.message.unwrap();
        assert!(message.contains("delta"));
        assert!(message.contains("not found"));
        assert!(message.contains("restarting from first repository"));
    }

    #[test]
    fn prepare_resume_ignores_other_endpoints() {
        let mut st = state(meta(&[("repo", "delta")]));
        let before = st.clone();
        let pos = prepare_resume(
            &candidates(), &mut st, "teams-users", "team", "team_index", "team", "acme",
        );
        assert_eq!(pos, ResumePosition::default());
        assert_eq!(st, before);
    }

    #[test]
    fn prepare_resume_noop_without_identifying_keys() {
        let mut st = state(Metadata::new());
        let before = st.clone();
        let pos = prepare_resume(
            &candidates(), &mut st, "repos-users", "repo", "repo_index", "repository", "acme",
        );
        assert_eq!(pos.index, None);
        assert!(pos.message.is_none());
        assert_eq!(st, before);
    }
}
