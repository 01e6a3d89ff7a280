//! Script bookkeeping and identifier translation.
//!
//! The debuggee names scripts by numeric id and file path; the client names
//! them by string id and url. The registry is append-only for the life of a
//! backend: scripts are added on reload, on single-id lookup, and on compile
//! events, and never removed.

use crate::backend::Requester;
use crate::errors::{BridgeError, BridgeResult};
use crate::pipeline::{Capability, Plugin, PluginContext};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Module wrapper the debuggee puts around every user script
pub const MODULE_PROLOGUE: &str = "(function (exports, require, module, __filename, __dirname) { ";
pub const MODULE_EPILOGUE: &str = "\n});";

const FILE_SCHEME: &str = "file://";
const INTERNAL_PREFIX: &str = "internal/";

/// Legacy `scripts` filter selecting normal (non-native, non-extension) scripts
const NORMAL_SCRIPTS: u32 = 4;

/// Script as reported by the legacy `scripts` command or `afterCompile`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptDescriptor {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub line_offset: u32,
    #[serde(default)]
    pub column_offset: u32,
    #[serde(default)]
    pub line_count: Option<u32>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub id: u64,
    /// File path, or a bare name for runtime-internal scripts
    pub path: String,
    pub url: String,
    pub internal: bool,
    pub start_line: u32,
    pub start_column: u32,
    pub line_count: Option<u32>,
}

impl Script {
    pub fn from_descriptor(descriptor: &ScriptDescriptor) -> Self {
        let path = descriptor.name.as_deref().unwrap_or_default().replace('\\', "/");
        let internal = !is_absolute(&path);
        Script {
            id: descriptor.id,
            url: path_to_url(&path, internal),
            path,
            internal,
            start_line: descriptor.line_offset,
            start_column: descriptor.column_offset,
            line_count: descriptor.line_count,
        }
    }

    pub fn script_id(&self) -> String {
        self.id.to_string()
    }

    /// Params of `Debugger.scriptParsed`
    pub fn parsed_params(&self) -> Value {
        let mut params = json!({
            "scriptId": self.script_id(),
            "url": self.url,
            "startLine": self.start_line,
            "startColumn": self.start_column,
            "isContentScript": false,
            "isInternalScript": self.internal,
        });
        if let Some(count) = self.line_count {
            params["endLine"] = json!(self.start_line + count);
            params["endColumn"] = json!(0);
        }
        params
    }

    /// Entry of `Page.getResourceTree`
    pub fn resource(&self) -> Value {
        json!({
            "url": self.url,
            "type": "Script",
            "mimeType": "text/javascript",
        })
    }
}

/// Outcome of [`ScriptRegistry::add`]
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Added(Arc<Script>),
    /// The id was already registered; carries the original record
    Known(Arc<Script>),
}

impl Registration {
    pub fn script(&self) -> &Arc<Script> {
        match self {
            Registration::Added(script) | Registration::Known(script) => script,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Registration::Added(_))
    }

    /// The script only if this call added it
    pub fn added(self) -> Option<Arc<Script>> {
        match self {
            Registration::Added(script) => Some(script),
            Registration::Known(_) => None,
        }
    }
}

/// Result of a live edit
#[derive(Debug, Clone)]
pub struct LiveEdit {
    pub script: Arc<Script>,
    /// Frames on the stack were replaced; callers must refetch it
    pub stack_modified: bool,
    /// The debuggee wants a step-in before the stack is consistent again
    pub stack_update_needs_step_in: bool,
    /// `result` object of the legacy response
    pub result: Value,
}

#[derive(Default)]
struct ScriptTable {
    scripts: Vec<Arc<Script>>,
    by_id: HashMap<u64, usize>,
    sources: HashMap<u64, String>,
}

pub struct ScriptRegistry {
    table: RwLock<ScriptTable>,
    save_live_edit: bool,
}

impl ScriptRegistry {
    pub fn new(save_live_edit: bool) -> Self {
        ScriptRegistry {
            table: RwLock::new(ScriptTable::default()),
            save_live_edit,
        }
    }

    /// Register a script; a known id keeps its original record.
    pub fn add(&self, descriptor: &ScriptDescriptor) -> Registration {
        let mut table = self.table.write();
        if let Some(&index) = table.by_id.get(&descriptor.id) {
            return Registration::Known(Arc::clone(&table.scripts[index]));
        }

        let script = Arc::new(Script::from_descriptor(descriptor));
        debug!("Registered script {} ({})", script.id, script.url);

        let index = table.scripts.len();
        table.scripts.push(Arc::clone(&script));
        table.by_id.insert(script.id, index);
        if let Some(source) = &descriptor.source {
            table.sources.insert(script.id, source.clone());
        }
        Registration::Added(script)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Script>> {
        let table = self.table.read();
        table.by_id.get(&id).map(|&i| Arc::clone(&table.scripts[i]))
    }

    pub fn resolve_by_url(&self, url: &str) -> Option<Arc<Script>> {
        self.table
            .read()
            .scripts
            .iter()
            .find(|s| s.url == url)
            .cloned()
    }

    /// All scripts in registration order
    pub fn all(&self) -> Vec<Arc<Script>> {
        self.table.read().scripts.clone()
    }

    pub fn len(&self) -> usize {
        self.table.read().scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch the full script list and register what is new.
    ///
    /// Returns the newly added scripts.
    pub async fn reload(&self, requester: &dyn Requester) -> BridgeResult<Vec<Arc<Script>>> {
        let body = requester
            .request(
                "scripts",
                json!({"types": NORMAL_SCRIPTS, "includeSource": true}),
            )
            .await?;
        let descriptors: Vec<ScriptDescriptor> = serde_json::from_value(body)?;

        let added: Vec<_> = descriptors
            .iter()
            .filter_map(|d| self.add(d).added())
            .collect();
        info!(
            "Script reload: {} new, {} total",
            added.len(),
            self.len()
        );
        Ok(added)
    }

    /// Look up by id, asking the debuggee when the id is not registered yet.
    pub async fn resolve_by_id(
        &self,
        requester: &dyn Requester,
        id: u64,
    ) -> BridgeResult<Arc<Script>> {
        if let Some(script) = self.get(id) {
            return Ok(script);
        }

        let descriptor = self.query_one(requester, id, false).await?;
        Ok(Arc::clone(self.add(&descriptor).script()))
    }

    pub async fn get_source(&self, requester: &dyn Requester, id: u64) -> BridgeResult<String> {
        if let Some(source) = self.table.read().sources.get(&id) {
            return Ok(source.clone());
        }

        let descriptor = self.query_one(requester, id, true).await?;
        let source = descriptor
            .source
            .clone()
            .ok_or_else(|| BridgeError::ScriptNotFound(format!("no source for script {}", id)))?;

        self.add(&descriptor);
        self.table.write().sources.insert(id, source.clone());
        Ok(source)
    }

    /// Replace a script's source in the running debuggee.
    ///
    /// `new_source` must be a complete module, wrapper included. With
    /// write-back enabled a non-preview edit also rewrites the file on disk.
    pub async fn set_source(
        &self,
        requester: &dyn Requester,
        id: u64,
        new_source: &str,
        preview_only: bool,
    ) -> BridgeResult<LiveEdit> {
        let body = unwrap_module(new_source).ok_or_else(|| {
            BridgeError::LiveEdit("new source is not wrapped as a module".to_string())
        })?;

        let script = self.resolve_by_id(requester, id).await?;
        let write_back = !preview_only && self.save_live_edit;
        if write_back && script.internal {
            return Err(BridgeError::LiveEdit(format!(
                "cannot write back internal script {}",
                script.path
            )));
        }

        let response = requester
            .request(
                "changelive",
                json!({
                    "script_id": id,
                    "new_source": new_source,
                    "preview_only": preview_only,
                }),
            )
            .await?;
        let result = response.get("result").cloned().unwrap_or(Value::Null);
        let flag = |name: &str| result.get(name).and_then(Value::as_bool).unwrap_or(false);

        let edit = LiveEdit {
            script: Arc::clone(&script),
            stack_modified: flag("stack_modified"),
            stack_update_needs_step_in: flag("stack_update_needs_step_in"),
            result: result.clone(),
        };

        if !preview_only {
            self.table.write().sources.insert(id, new_source.to_string());
            if write_back {
                tokio::fs::write(&script.path, body).await?;
                info!("Live edit of {} written back", script.path);
            }
        }

        Ok(edit)
    }

    async fn query_one(
        &self,
        requester: &dyn Requester,
        id: u64,
        include_source: bool,
    ) -> BridgeResult<ScriptDescriptor> {
        let body = requester
            .request(
                "scripts",
                json!({"types": NORMAL_SCRIPTS, "includeSource": include_source, "filter": id}),
            )
            .await?;
        let descriptors: Vec<ScriptDescriptor> = serde_json::from_value(body)?;
        descriptors
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| BridgeError::ScriptNotFound(id.to_string()))
    }
}

/// Location as the legacy protocol reports it
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LegacyLocation {
    pub script_id: u64,
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

/// Location as the client expects it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientLocation {
    pub script_id: String,
    pub line_number: u32,
    #[serde(default)]
    pub column_number: u32,
}

impl From<LegacyLocation> for ClientLocation {
    fn from(location: LegacyLocation) -> Self {
        ClientLocation {
            script_id: location.script_id.to_string(),
            line_number: location.line,
            column_number: location.column,
        }
    }
}

/// Client script ids are decimal strings of the legacy numeric id
pub fn parse_script_id(id: &str) -> BridgeResult<u64> {
    id.parse()
        .map_err(|_| BridgeError::InvalidParams(format!("invalid script id {:?}", id)))
}

/// POSIX absolute path or a drive-letter path
pub fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || (bytes.len() >= 3
            && bytes[0].is_ascii_alphabetic()
            && bytes[1] == b':'
            && (bytes[2] == b'/' || bytes[2] == b'\\'))
}

pub fn path_to_url(path: &str, internal: bool) -> String {
    let prefix = if internal { INTERNAL_PREFIX } else { "" };
    format!("{}{}{}", FILE_SCHEME, prefix, path.replace('\\', "/"))
}

pub fn url_to_path(url: &str) -> String {
    let rest = url.strip_prefix(FILE_SCHEME).unwrap_or(url);
    rest.strip_prefix(INTERNAL_PREFIX).unwrap_or(rest).to_string()
}

pub fn wrap_module(body: &str) -> String {
    format!("{}{}{}", MODULE_PROLOGUE, body, MODULE_EPILOGUE)
}

/// Body of a wrapped module, or `None` if the wrapper is missing
pub fn unwrap_module(source: &str) -> Option<&str> {
    source
        .strip_prefix(MODULE_PROLOGUE)?
        .strip_suffix(MODULE_EPILOGUE)
}

/// Exposes this backend's [`ScriptRegistry`]
pub struct ScriptsPlugin;

#[async_trait]
impl Plugin for ScriptsPlugin {
    fn name(&self) -> &str {
        crate::agents::SCRIPTS
    }

    async fn init(&self, cx: PluginContext) -> BridgeResult<Capability> {
        let registry = ScriptRegistry::new(cx.pipeline().options().save_live_edit);
        Ok(Arc::new(registry))
    }
}
