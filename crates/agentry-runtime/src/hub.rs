//! The hub: one process-wide owner of the store, the provider, and the
//! shared tool/plugin catalogues, holding every agency.
//!
//! Registries are built once through the builder and never mutated after
//! export; agents receive cloned references at registration.

use crate::agency::Agency;
use crate::plugin::{HitlPlugin, Plugin};
use agentry_core::{AgencyRecord, Error, HubConfig, Result};
use agentry_llm::ModelProvider;
use agentry_store::Store;
use agentry_tools::{Registry, TaskTool, Tool, ToolRegistry};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct HubShared {
    pub provider: Arc<dyn ModelProvider>,
    pub tools: Arc<ToolRegistry>,
    pub plugins: Arc<Registry<Arc<dyn Plugin>>>,
    /// Always-on plugins, ahead of any capability-selected ones.
    pub base_plugins: Vec<Arc<dyn Plugin>>,
    pub default_model: String,
    pub env: Arc<BTreeMap<String, String>>,
}

struct HubInner {
    config: HubConfig,
    store: Store,
    shared: Arc<HubShared>,
    agencies: DashMap<String, Agency>,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

pub struct HubBuilder {
    config: HubConfig,
    provider: Option<Arc<dyn ModelProvider>>,
    tools: ToolRegistry,
    plugins: Registry<Arc<dyn Plugin>>,
    base_plugins: Vec<Arc<dyn Plugin>>,
    env: BTreeMap<String, String>,
}

impl HubBuilder {
    pub fn provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn register_tool(mut self, tags: &[&str], tool: Arc<dyn Tool>) -> Self {
        self.tools.register_tagged(tool.name().to_string(), tags, tool);
        self
    }

    pub fn register_plugin(
        mut self,
        name: impl Into<String>,
        tags: &[&str],
        plugin: Arc<dyn Plugin>,
    ) -> Self {
        self.plugins.register_tagged(name, tags, plugin);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Open the store, rehydrate persisted agencies and re-arm schedules.
    pub async fn build(self) -> Result<Hub> {
        let provider = self
            .provider
            .ok_or_else(|| Error::validation("hub requires a model provider"))?;
        std::fs::create_dir_all(&self.config.data_dir)?;
        let store = Store::open(Path::new(&self.config.data_dir).join("hub.redb"))?;

        let shared = Arc::new(HubShared {
            provider,
            tools: Arc::new(self.tools),
            plugins: Arc::new(self.plugins),
            base_plugins: self.base_plugins,
            default_model: self.config.default_model.clone(),
            env: Arc::new(self.env),
        });
        let hub = Hub {
            inner: Arc::new(HubInner {
                config: self.config,
                store,
                shared,
                agencies: DashMap::new(),
            }),
        };

        for record in hub.inner.store.list_agencies()? {
            let agency = Agency::new(
                record.name.clone(),
                hub.inner.store.clone(),
                hub.inner.shared.clone(),
            );
            agency.rehydrate().await?;
            agency.scheduler().start()?;
            hub.inner.agencies.insert(record.name, agency);
        }
        info!(agencies = hub.inner.agencies.len(), "hub ready");
        Ok(hub)
    }
}

impl Hub {
    /// Builder preloaded with the built-in task tool and the HITL plugin.
    pub fn builder(config: HubConfig) -> HubBuilder {
        let mut tools = ToolRegistry::new();
        let task: Arc<dyn Tool> = Arc::new(TaskTool);
        tools.register_tagged("task", &["subagent"], task);
        HubBuilder {
            config,
            provider: None,
            tools,
            plugins: Registry::new(),
            base_plugins: vec![Arc::new(HitlPlugin) as Arc<dyn Plugin>],
            env: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn create_agency(&self, name: &str) -> Result<Agency> {
        let record = self.inner.store.create_agency(name)?;
        let agency = Agency::new(
            record.name.clone(),
            self.inner.store.clone(),
            self.inner.shared.clone(),
        );
        agency.scheduler().start()?;
        self.inner.agencies.insert(record.name, agency.clone());
        info!(agency = %name, "agency created");
        Ok(agency)
    }

    pub fn agency(&self, name: &str) -> Option<Agency> {
        self.inner.agencies.get(name).map(|a| a.clone())
    }

    pub fn require_agency(&self, name: &str) -> Result<Agency> {
        self.agency(name)
            .ok_or_else(|| Error::not_found(format!("agency '{name}'")))
    }

    pub fn list_agencies(&self) -> Result<Vec<AgencyRecord>> {
        self.inner.store.list_agencies()
    }

    /// Explicit delete; cascades through schedules, agents and catalogues.
    pub async fn delete_agency(&self, name: &str) -> Result<()> {
        let agency = self.require_agency(name)?;
        agency.delete().await?;
        self.inner.agencies.remove(name);
        info!(agency = %name, "agency deleted");
        Ok(())
    }
}
