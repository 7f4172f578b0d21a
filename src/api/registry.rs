use crate::config::Config;
use crate::errors::AppError;
use crate::session::{Session, SessionSlot};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

pub type DynOp = Arc<dyn Op + Send + Sync + 'static>;

/// Per-call context handed to every operation: the static config plus the
/// session slot. Nothing here is ambient global state; independent
/// registries and slots can coexist in tests.
#[derive(Clone)]
pub struct OpCtx {
    pub cfg: Arc<Config>,
    pub sessions: Arc<SessionSlot>,
}

impl OpCtx {
    pub fn session(&self) -> Result<Arc<Session>, AppError> {
        self.sessions.current()
    }
}

#[derive(Clone)]
pub struct OpRegistry {
    ops: Vec<(String, DynOp)>,
}

impl OpRegistry {
    pub fn new() -> Self {
        use crate::ops::lifecycle::{
            ApplyOp, DestroyOp, InitOp, PlanOp, RunCancelOp, ValidateOp,
        };
        use crate::ops::project::{BinaryVersionOp, ProjectCloseOp, ProjectOpenOp};
        use crate::ops::state::{OutputShowOp, StateListOp, StateShowOp};
        use crate::ops::variables::{
            TfvarsExportOp, TfvarsImportOp, VariablesListOp, VariablesSetOp,
        };
        use crate::ops::workspace::{
            WorkspaceDeleteOp, WorkspaceListOp, WorkspaceNewOp, WorkspaceSelectOp,
        };

        let mut ops: Vec<(String, DynOp)> = vec![
            ("project_open".to_string(), Arc::new(ProjectOpenOp)),
            ("project_close".to_string(), Arc::new(ProjectCloseOp)),
            ("binary_version".to_string(), Arc::new(BinaryVersionOp)),
            ("variables_list".to_string(), Arc::new(VariablesListOp)),
            ("variables_set".to_string(), Arc::new(VariablesSetOp)),
            ("tfvars_import".to_string(), Arc::new(TfvarsImportOp)),
            ("tfvars_export".to_string(), Arc::new(TfvarsExportOp)),
            ("init".to_string(), Arc::new(InitOp)),
            ("validate".to_string(), Arc::new(ValidateOp)),
            ("plan".to_string(), Arc::new(PlanOp)),
            ("apply".to_string(), Arc::new(ApplyOp)),
            ("destroy".to_string(), Arc::new(DestroyOp)),
            ("run_cancel".to_string(), Arc::new(RunCancelOp)),
            ("workspace_list".to_string(), Arc::new(WorkspaceListOp)),
            ("workspace_select".to_string(), Arc::new(WorkspaceSelectOp)),
            ("workspace_new".to_string(), Arc::new(WorkspaceNewOp)),
            ("workspace_delete".to_string(), Arc::new(WorkspaceDeleteOp)),
            ("state_list".to_string(), Arc::new(StateListOp)),
            ("state_show".to_string(), Arc::new(StateShowOp)),
            ("output_show".to_string(), Arc::new(OutputShowOp)),
        ];
        ops.sort_by(|a, b| a.0.cmp(&b.0));
        Self { ops }
    }

    pub fn get(&self, name: &str) -> Option<DynOp> {
        self.ops
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, op)| op.clone())
    }

    pub fn list_names(&self) -> Vec<String> {
        self.ops.iter().map(|(n, _)| n.clone()).collect()
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    pub id: String,
    pub op: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub stream: bool,
}

#[async_trait]
pub trait Op {
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> serde_json::Value;
    async fn call(&self, ctx: &OpCtx, params: serde_json::Value)
        -> Result<serde_json::Value, AppError>;
    async fn call_stream(
        &self,
        _ctx: &OpCtx,
        _params: serde_json::Value,
    ) -> Result<crate::server::StreamBody, AppError> {
        Err(AppError::Op("streaming not supported".into()))
    }
}
