use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::policy::ConflictPolicy;
use super::reconciled::ReconciledView;
use crate::filter::{Filter, SortOrder};
use crate::identity::IdentityContext;
use crate::store::RemoteStore;

/// How a view reacts to a push event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventMode {
    /// Merge the event's row into the snapshot.
    #[default]
    Merge,
    /// Merge the row, then re-fetch the whole collection.
    Refetch,
}

/// Definition of one collection view. Serializable so screens can be
/// described in JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewConfig {
    pub table: String,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub event_mode: EventMode,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Writes need the elevated role, whoever owns the row.
    #[serde(default)]
    pub require_elevated_role: bool,
}

impl ViewConfig {
    pub fn builder(table: &str) -> ViewBuilder {
        ViewBuilder::new(table)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: ViewConfig = serde_json::from_str(json)?;
        if config.table.trim().is_empty() {
            anyhow::bail!("view config has an empty table name");
        }
        Ok(config)
    }
}

pub struct ViewBuilder {
    config: ViewConfig,
}

impl ViewBuilder {
    pub fn new(table: &str) -> Self {
        Self {
            config: ViewConfig {
                table: table.to_string(),
                filter: Filter::all(),
                order: SortOrder::new(),
                event_mode: EventMode::default(),
                conflict_policy: ConflictPolicy::default(),
                require_elevated_role: false,
            },
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.config.filter = filter;
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.config.order = order;
        self
    }

    pub fn event_mode(mut self, mode: EventMode) -> Self {
        self.config.event_mode = mode;
        self
    }

    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.config.conflict_policy = policy;
        self
    }

    pub fn require_elevated_role(mut self, required: bool) -> Self {
        self.config.require_elevated_role = required;
        self
    }

    pub fn build(self) -> ViewConfig {
        self.config
    }

    /// Builds the config and a view over it. The view is not mounted yet.
    pub fn open(self, store: Arc<dyn RemoteStore>, identity: IdentityContext) -> ReconciledView {
        ReconciledView::new(store, identity, self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let config = ViewConfig::builder("posts").build();
        assert_eq!(config.table, "posts");
        assert!(config.filter.is_empty());
        assert_eq!(config.event_mode, EventMode::Merge);
        assert_eq!(config.conflict_policy, ConflictPolicy::PreferPending);
        assert!(!config.require_elevated_role);
    }

    #[test]
    fn loads_from_json() -> anyhow::Result<()> {
        let config = ViewConfig::from_json(
            r#"{
                "table": "quotes",
                "filter": {"category": "cartas"},
                "order": [
                    {"field": "priority", "descending": true},
                    {"field": "created_at", "descending": true}
                ],
                "event_mode": "refetch",
                "conflict_policy": "prefer_remote_delete",
                "require_elevated_role": true
            }"#,
        )?;
        let expected = ViewConfig::builder("quotes")
            .filter(Filter::all().eq("category", "cartas"))
            .order(SortOrder::new().desc("priority").desc("created_at"))
            .event_mode(EventMode::Refetch)
            .conflict_policy(ConflictPolicy::PreferRemoteDelete)
            .require_elevated_role(true)
            .build();
        assert_eq!(config, expected);
        Ok(())
    }

    #[test]
    fn json_fills_defaults_and_rejects_empty_table() -> anyhow::Result<()> {
        let config = ViewConfig::from_json(r#"{"table": "playlists"}"#)?;
        assert_eq!(config, ViewConfig::builder("playlists").build());
        assert!(ViewConfig::from_json(r#"{"table": "  "}"#).is_err());
        assert!(ViewConfig::from_json(r#"{"filter": {}}"#).is_err());
        Ok(())
    }
}
