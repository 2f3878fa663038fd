mod config;

use std::sync::Arc;

use redislock::{KeyScheme, LockClient, LockOpts, Ownership, RedisStore};

use config::config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(config().log_level)
        .init()?;

    let store = RedisStore::connect(&config().redis).await?;
    let mut lock_client = LockClient::new(Arc::new(store), &config().prefix);
    if config().per_resource {
        lock_client = lock_client.with_key_scheme(KeyScheme::PerResource);
    }
    if config().verify_ownership {
        lock_client = lock_client.with_ownership(Ownership::Verified);
    }

    let mut lock = lock_client.new_lock(LockOpts {
        lock_key: config().lock_key.clone(),
        holder: config().holder.clone(),
        auto_renew: config().auto_renew,
        lease_duration: config().lease_duration,
    })?;

    match config().wait {
        None => {
            if !lock.try_lock().await? {
                log::info!("Lock {} is held by someone else", lock.lock_key());
                return Ok(());
            }
        }
        Some(timeout) => {
            log::info!("Waiting up to {:?} for lock {}", timeout, lock.lock_key());
            lock.lock(timeout).await?;
        }
    }

    log::info!(
        "Acquired lock {} as {}. Holding it for {:?}",
        lock.lock_key(),
        lock.holder(),
        config().hold
    );
    tokio::select! {
        _ = tokio::time::sleep(config().hold) => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("Interrupted. Releasing lock early");
        }
    }

    lock.unlock().await?;
    log::info!("Released lock {}", lock.lock_key());
    Ok(())
}
