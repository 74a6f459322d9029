//! Supervisory loops for both ends of the link: open the port and keep
//! reopening it, drive the transfer state machines, catch and log every
//! per-file error, and stop cleanly on interruption.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::{Pacing, PortProfile, ReceiverLayout, SenderLayout, Timeouts, Verdict};
use crate::fsops::{self, CreateHook};
use crate::receiver::ReceiverContext;
use crate::sender::SenderContext;
use crate::transport::PortLink;
use crate::{Error, Result};

/// The sending process: scan the incoming tree, transfer every file,
/// dispose of it, repeat. Build via [`crate::DaemonBuilder`].
pub struct SenderDaemon {
    pub(crate) profile: PortProfile,
    pub(crate) layout: SenderLayout,
    pub(crate) timeouts: Timeouts,
    pub(crate) pacing: Pacing,
}

impl SenderDaemon {
    /// Runs until `shutdown` is raised. Port trouble is retried forever;
    /// everything else is logged and the loop resumes after a rest.
    pub fn run(&self, shutdown: &AtomicBool) -> Result<()> {
        log::info!("---- send process starting ----");
        while !shutdown.load(Ordering::Relaxed) {
            let Some(link) = self.open_port(shutdown) else {
                break;
            };
            let mut ctx =
                SenderContext::with_tuning(link, self.timeouts.clone(), self.pacing.clone());
            ctx.send_update(&format!("Startup - serial port {} opened", self.profile.path));

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    ctx.send_update("send process is shutting down");
                    ctx.quiesce();
                    log::info!("---- send process stopped ----");
                    return Ok(());
                }
                match self.scan_pass(&mut ctx, shutdown) {
                    Ok((0, 0)) => {}
                    Ok((delivered, failed)) => {
                        log::info!("transfer pass complete ({delivered} delivered, {failed} failed)");
                    }
                    Err(Error::Interrupted) => {
                        ctx.send_update("send process is shutting down");
                        ctx.quiesce();
                        log::info!("---- send process stopped ----");
                        return Ok(());
                    }
                    Err(e @ Error::Io(_)) => {
                        log::error!("port failure, reopening: {e}");
                        rest(self.pacing.error_rest, shutdown);
                        break;
                    }
                    Err(e) => {
                        log::error!("transfer error, restarting scan: {e}");
                        rest(self.pacing.error_rest, shutdown);
                    }
                }
                rest(self.pacing.scan_rest, shutdown);
            }
        }
        log::info!("---- send process stopped ----");
        Ok(())
    }

    /// One pass over the incoming tree. Every discovered file is cached,
    /// transferred, and disposed of; the first hard error ends the pass
    /// after disposition has run.
    fn scan_pass(
        &self,
        ctx: &mut SenderContext<PortLink>,
        shutdown: &AtomicBool,
    ) -> Result<(u32, u32)> {
        ctx.idle_tick()?;
        if !self.layout.incoming.is_dir() {
            log::warn!(
                "source folder {} not found; shared folder may not be mounted",
                self.layout.incoming.display()
            );
            ctx.send_update(&format!(
                "Source folder {} not found",
                self.layout.incoming.display()
            ));
            return Ok((0, 0));
        }

        let mut delivered = 0u32;
        let mut failed = 0u32;
        for discovered in fsops::scan(&self.layout.incoming) {
            if shutdown.load(Ordering::Relaxed) {
                return Err(Error::Interrupted);
            }
            let cache = match fsops::cache_copy(&self.layout, &discovered) {
                Ok(path) => path,
                Err(e) => {
                    log::error!("could not cache {}: {e}", discovered.source.display());
                    continue;
                }
            };
            let result = ctx.send_file(&discovered.wire_name(), &cache, shutdown);
            let verdict = match &result {
                Ok(v) => *v,
                Err(_) => Verdict::Failed,
            };
            fsops::dispose_source(&self.layout, &discovered, verdict);
            fsops::drop_cache(&cache);
            match result {
                Ok(Verdict::Delivered) => delivered += 1,
                Ok(Verdict::Failed) => failed += 1,
                Err(e) => {
                    log::error!("transfer of {:?} failed: {e}", discovered.wire_name());
                    return Err(e);
                }
            }
            thread::sleep(self.pacing.settle);
        }
        Ok((delivered, failed))
    }

    fn open_port(&self, shutdown: &AtomicBool) -> Option<PortLink> {
        open_with_retry(&self.profile, self.pacing.reopen_rest, shutdown)
    }
}

/// The receiving process: wait for files, verify, promote or demote,
/// repeat. Build via [`crate::DaemonBuilder`].
pub struct ReceiverDaemon {
    pub(crate) profile: PortProfile,
    pub(crate) layout: ReceiverLayout,
    pub(crate) timeouts: Timeouts,
    pub(crate) pacing: Pacing,
    pub(crate) post_create: Option<CreateHook>,
}

impl ReceiverDaemon {
    /// Runs until `shutdown` is raised, mirroring [`SenderDaemon::run`].
    pub fn run(&self, shutdown: &AtomicBool) -> Result<()> {
        log::info!("---- receive process starting ----");
        while !shutdown.load(Ordering::Relaxed) {
            let Some(link) = open_with_retry(&self.profile, self.pacing.reopen_rest, shutdown)
            else {
                break;
            };
            let mut ctx = ReceiverContext::with_tuning(
                link,
                self.layout.clone(),
                self.timeouts.clone(),
                self.pacing.clone(),
            );
            if let Some(hook) = &self.post_create {
                ctx = ctx.on_create(hook.clone());
            }

            loop {
                if shutdown.load(Ordering::Relaxed) {
                    ctx.quiesce();
                    log::info!("---- receive process stopped ----");
                    return Ok(());
                }
                match ctx.receive_one(shutdown) {
                    Ok(delivery) => {
                        log::info!(
                            "{} {} ({} bytes)",
                            delivery.relative.display(),
                            delivery.verdict,
                            delivery.bytes
                        );
                        rest(self.pacing.receive_rest, shutdown);
                    }
                    Err(Error::Interrupted) => {
                        ctx.quiesce();
                        log::info!("---- receive process stopped ----");
                        return Ok(());
                    }
                    Err(e @ Error::Io(_)) => {
                        log::error!("port failure, reopening: {e}");
                        rest(self.pacing.error_rest, shutdown);
                        break;
                    }
                    Err(e) => {
                        log::error!("transfer error, restarting: {e}");
                        rest(self.pacing.error_rest, shutdown);
                    }
                }
            }
        }
        log::info!("---- receive process stopped ----");
        Ok(())
    }
}

/// Opens the port, retrying forever at a fixed interval. `None` means
/// shutdown was requested while waiting.
fn open_with_retry(
    profile: &PortProfile,
    retry: Duration,
    shutdown: &AtomicBool,
) -> Option<PortLink> {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return None;
        }
        match PortLink::open(profile) {
            Ok(link) => {
                log::info!("---- serial port {} opened ----", profile.path);
                return Some(link);
            }
            Err(e) => {
                log::error!("could not open serial port {}: {e}; retrying", profile.path);
                rest(retry, shutdown);
            }
        }
    }
}

/// Sleeps in small steps so a shutdown request cuts the wait short.
fn rest(total: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(100).min(total);
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::Relaxed) {
        let nap = step.min(remaining);
        thread::sleep(nap);
        remaining -= nap;
    }
}
