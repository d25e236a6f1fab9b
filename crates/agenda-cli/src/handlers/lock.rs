use crate::cli::LockAction;
use crate::context::CliContext;
use crate::output;
use agenda_engine::lock::ReleaseLockCmd;
use agenda_engine::LockManager;
use std::sync::Arc;
use std::time::Duration;

fn manager(ctx: &CliContext, name: &str, owner: &str) -> LockManager {
    LockManager::new(Arc::clone(ctx.engine.command_executor()), name, owner)
}

pub fn handle(ctx: &CliContext, action: LockAction) -> anyhow::Result<()> {
    match action {
        LockAction::Acquire {
            name,
            owner,
            force_after_ms,
        } => {
            let mut lock = manager(ctx, &name, &owner);
            if let Some(ms) = force_after_ms {
                lock = lock.with_force_acquire_after(Some(Duration::from_millis(ms)));
            }
            let acquired = lock.acquire_lock()?;
            let holder = lock.lock_value()?;
            output::output_success(serde_json::json!({
                "name": name,
                "acquired": acquired,
                "holder": holder,
            }));
        }
        LockAction::Release { name, owner, force } => {
            // Another invocation took the lock, so release by owner id on the row
            let released = if force {
                manager(ctx, &name, owner.as_deref().unwrap_or("admin")).force_release()?
            } else {
                ctx.engine.command_executor().execute(&ReleaseLockCmd {
                    name: name.clone(),
                    owner: owner.clone(),
                })?
            };
            output::output_success(serde_json::json!({ "name": name, "released": released }));
        }
        LockAction::Status { name } => {
            let holder = manager(ctx, &name, "status").lock_value()?;
            output::output_success(serde_json::json!({
                "name": name,
                "locked": holder.is_some(),
                "holder": holder,
            }));
        }
        LockAction::Wait {
            name,
            owner,
            timeout_ms,
        } => {
            let lock = manager(ctx, &name, &owner);
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| ctx.engine.config().lock.default_wait());
            lock.wait_for_lock(timeout)?;
            output::output_success(serde_json::json!({
                "name": name,
                "acquired": true,
                "holder": owner,
            }));
        }
    }
    Ok(())
}
