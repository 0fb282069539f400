use std::path::Path;
use std::sync::Arc;

use offload_core::auth::{Caller, Capability, TokenIssuer};
use offload_core::catalog::WorkItemSource;
use offload_core::catalog::fs::FsCatalog;
use offload_core::clock::{Clock, SystemClock};
use offload_core::state::fs::FsStateStore;
use offload_core::storage::fs::FsObjectStore;
use offload_core::{
    BulkDeleter, JobController, OffloadConfig, OffloadError, RemovalHandler, Result, StallCheck,
    StallMonitor, TickEvent, UploadWorker,
};
use serde::Serialize;
use serde_json::json;

use crate::presentation::cli::{Cli, Role};

const LEDGER_FILE: &str = "catalog.log";

pub fn load_config(path: Option<&Path>) -> Result<OffloadConfig> {
    let config = match path {
        Some(p) => {
            let raw = std::fs::read(p)?;
            serde_json::from_slice::<OffloadConfig>(&raw)
                .map_err(|e| OffloadError::Config(format!("{}: {e}", p.display())))?
        }
        None => OffloadConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

pub fn capabilities(role: Role) -> Vec<Capability> {
    match role {
        Role::Admin => vec![Capability::ManageOffload, Capability::ViewProgress],
        Role::Author => vec![Capability::ViewProgress],
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let s = serde_json::to_string_pretty(value).map_err(|e| OffloadError::Codec(e.to_string()))?;
    println!("{s}");
    Ok(())
}

/// Everything a command needs, opened once from the global flags.
pub struct Env {
    config: OffloadConfig,
    user: String,
    role: Role,
    state: Arc<FsStateStore>,
    catalog: Arc<FsCatalog>,
    objects: Arc<FsObjectStore>,
    clock: Arc<dyn Clock>,
}

impl Env {
    pub fn open(cli: &Cli) -> Result<Self> {
        let config = load_config(cli.config.as_deref())?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = Arc::new(FsStateStore::open(&cli.state_dir.join("kv"))?);
        let catalog = Arc::new(FsCatalog::open(
            &cli.media_root,
            &cli.state_dir.join(LEDGER_FILE),
            clock.clone(),
        )?);
        let objects = Arc::new(FsObjectStore::open(&cli.bucket_dir, &config.public_base_url)?);
        Ok(Self {
            config,
            user: cli.user.clone(),
            role: cli.role,
            state,
            catalog,
            objects,
            clock,
        })
    }

    fn tokens(&self) -> Result<TokenIssuer> {
        TokenIssuer::load_or_create(self.state.as_ref(), self.config.token_lifetime_secs)
    }

    fn caller(&self, token: String) -> Caller {
        Caller {
            user: self.user.clone(),
            capabilities: capabilities(self.role),
            token,
        }
    }

    fn controller(&self) -> Result<JobController> {
        let worker = UploadWorker::new(
            self.objects.clone(),
            self.catalog.clone(),
            self.clock.clone(),
            &self.config.path_prefix,
        );
        Ok(JobController::new(
            self.config.clone(),
            self.state.clone(),
            self.catalog.clone(),
            Arc::new(worker),
            self.clock.clone(),
            self.tokens()?,
        ))
    }

    fn removal(&self) -> RemovalHandler {
        RemovalHandler::new(
            self.catalog.clone(),
            BulkDeleter::with_chunk_size(self.objects.clone(), self.config.delete_chunk()),
            self.state.clone(),
            self.clock.clone(),
            self.config.notice_ttl_secs,
        )
    }
}

pub fn handle_token(env: &Env, action: Option<String>) -> Result<()> {
    let action = action.unwrap_or_else(|| env.config.job_id.clone());
    let token = env.tokens()?.issue(&action, &env.user, env.clock.now());
    print_json(&json!({ "user": env.user, "action": action, "token": token }))
}

pub fn handle_start(env: &Env, token: String) -> Result<()> {
    match env.controller()?.start(&env.caller(token)) {
        Ok(outcome) => print_json(&outcome),
        Err(OffloadError::AlreadyRunning) => print_json(&json!({
            "total": 0,
            "message": OffloadError::AlreadyRunning.to_string(),
        })),
        Err(e) => Err(e),
    }
}

pub fn handle_run(env: &Env) -> Result<()> {
    let event = env.controller()?.run()?;
    let out = match event {
        TickEvent::Completed { processed, errors } => {
            json!({ "status": "completed", "processed": processed, "errors": errors })
        }
        TickEvent::Cancelled { processed } => {
            json!({ "status": "cancelled", "processed": processed })
        }
        TickEvent::Idle => json!({ "status": "idle" }),
        // run() only returns terminal events
        TickEvent::Processed { item_id, ok } => {
            json!({ "status": "processing", "item": item_id, "ok": ok })
        }
    };
    print_json(&out)
}

pub fn handle_progress(env: &Env, token: String) -> Result<()> {
    let p = env.controller()?.progress(&env.caller(token))?;
    print_json(&json!({
        "processed": p.processed,
        "total": p.total,
        "status": p.status,
        "errors": p.errors,
        "oversized_skipped": p.oversized_skipped,
        "percent": p.percent(),
    }))
}

pub fn handle_cancel(env: &Env, token: String) -> Result<()> {
    let message = env.controller()?.cancel(&env.caller(token))?;
    print_json(&json!({ "message": message }))
}

pub fn handle_watchdog(env: &Env, force: bool) -> Result<()> {
    let monitor = StallMonitor::new(env.config.clone(), env.state.clone(), env.clock.clone());
    let check = if force {
        monitor.check()?
    } else {
        monitor.run_if_due()?
    };
    let out = match check {
        StallCheck::Idle => json!({ "result": "idle" }),
        StallCheck::Healthy => json!({ "result": "healthy" }),
        StallCheck::NotDue => json!({ "result": "not_due" }),
        StallCheck::Recovered { stalled_for } => {
            json!({ "result": "recovered", "stalled_secs": stalled_for.as_secs() })
        }
    };
    print_json(&out)
}

pub fn handle_remove(env: &Env, item_id: &str) -> Result<()> {
    let Some(item) = env.catalog.get(item_id)? else {
        return Err(OffloadError::Catalog(format!("no media item {item_id}")));
    };

    let remote_ok = env.removal().on_remove(&env.user, &item)?;

    let dir = item.local_path.parent().map(Path::to_path_buf);
    let mut removed = vec![item.local_path.clone()];
    if let Some(dir) = &dir {
        removed.extend(item.derived.iter().map(|d| dir.join(&d.key)));
    }
    for path in &removed {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    print_json(&json!({
        "item": item.id,
        "local_files_removed": removed.len(),
        "remote_cleanup": remote_ok,
    }))
}

pub fn handle_notice(env: &Env) -> Result<()> {
    match env.removal().take_notice(&env.user)? {
        Some(notice) => print_json(&notice),
        None => print_json(&serde_json::Value::Null),
    }
}

pub fn handle_counts(env: &Env) -> Result<()> {
    print_json(&env.catalog.counts()?)
}
