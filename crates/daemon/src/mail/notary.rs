use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{MailNotaryJob, MailReceipt, MailTransport};
use crate::clock::Clock;
use crate::config::StamperConfig;
use crate::error::MailError;
use crate::signature::{extract_clearsigned, SignatureVerifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSettings {
    pub own_address: String,
    pub service_address: String,
    pub reply_from: String,
    pub keyid: String,
    pub window: chrono::Duration,
    pub poll: chrono::Duration,
    pub dovecot_workaround: bool,
}

impl From<&StamperConfig> for MailSettings {
    fn from(config: &StamperConfig) -> Self {
        Self {
            own_address: config.own_address.clone(),
            service_address: config.to.clone(),
            reply_from: config.from.clone(),
            keyid: config.keyid.clone(),
            window: chrono::Duration::seconds(config.window_secs as i64),
            poll: chrono::Duration::seconds(config.poll_secs as i64),
            dovecot_workaround: config.dovecot_bug_workaround,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<String>,
    receipt: Option<MailReceipt>,
}

struct Inner<T, V, C> {
    transport: T,
    verifier: V,
    clock: Arc<C>,
    settings: MailSettings,
    slot: Mutex<Slot>,
}

/// Runs at most one mail timestamp job at a time and hands verified
/// receipts to the orchestrator.
pub struct MailNotary<T, V, C> {
    inner: Arc<Inner<T, V, C>>,
}

impl<T, V, C> Clone for MailNotary<T, V, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, V, C> MailNotary<T, V, C>
where
    T: MailTransport,
    V: SignatureVerifier,
    C: Clock,
{
    pub fn new(transport: T, verifier: V, clock: Arc<C>, settings: MailSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                verifier,
                clock,
                settings,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.inner.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_pending(&self) -> bool {
        self.slot().pending.is_some()
    }

    /// Take the most recent verified receipt, if one arrived.
    pub fn take_receipt(&self) -> Option<MailReceipt> {
        self.slot().receipt.take()
    }

    /// The most recent verified receipt, left in place until acknowledged.
    pub fn receipt(&self) -> Option<MailReceipt> {
        self.slot().receipt.clone()
    }

    /// Drop `receipt` once it is safely on disk. A newer receipt that
    /// arrived in between stays.
    pub fn acknowledge(&self, receipt: &MailReceipt) {
        let mut slot = self.slot();
        if slot.receipt.as_ref() == Some(receipt) {
            slot.receipt = None;
        }
    }

    /// Start a job in the background. Returns false, without sending
    /// anything, while another job is still pending.
    pub fn request(&self, digest: &str) -> bool {
        if !self.claim(digest) {
            return false;
        }
        let this = self.clone();
        let digest = digest.to_string();
        tokio::spawn(async move {
            let _ = this.drive(digest).await;
        });
        true
    }

    /// Run one job to completion in the current task. `None` means another
    /// job was pending and nothing was sent.
    pub async fn timestamp(&self, digest: &str) -> Option<Result<MailReceipt, MailError>> {
        if !self.claim(digest) {
            return None;
        }
        Some(self.drive(digest.to_string()).await)
    }

    fn claim(&self, digest: &str) -> bool {
        let mut slot = self.slot();
        if let Some(pending) = &slot.pending {
            debug!(
                "Mail timestamp for {} still pending, not requesting {}",
                pending, digest
            );
            return false;
        }
        slot.pending = Some(digest.to_string());
        true
    }

    async fn drive(&self, digest: String) -> Result<MailReceipt, MailError> {
        // Released on every exit, including a panic or a dropped task
        let _pending = PendingGuard(&self.inner.slot);
        let result = self.exchange(&digest).await;
        let mut slot = self.slot();
        slot.pending = None;
        match &result {
            Ok(receipt) => {
                info!(
                    "Mail timestamp for {} received, signed by {}",
                    receipt.digest, receipt.signer
                );
                slot.receipt = Some(receipt.clone());
            }
            Err(MailError::Expired { window_end }) => {
                warn!(
                    "Mail timestamp for {} expired: no reply before {}",
                    digest, window_end
                );
            }
            Err(e) => warn!("Mail timestamp for {} abandoned: {}", digest, e),
        }
        result
    }

    async fn exchange(&self, digest: &str) -> Result<MailReceipt, MailError> {
        let settings = &self.inner.settings;
        let clock = &self.inner.clock;

        let mut job = MailNotaryJob::new(
            digest,
            &settings.own_address,
            &settings.reply_from,
            clock.now(),
            settings.window,
        );
        let outbound = job.outbound(&settings.own_address, &settings.service_address);
        self.inner.transport.send(&outbound).await?;
        info!(
            "Requested mail timestamp for {} from {}, waiting until {}",
            digest, settings.service_address, job.search_window_end
        );

        loop {
            let now = clock.now();
            if job.expire_if_due(now) {
                return Err(MailError::Expired {
                    window_end: job.search_window_end,
                });
            }

            let wake = (now + settings.poll).min(job.search_window_end);
            // At the window end itself, nudge past it so the next round expires
            let wake = if wake <= now {
                now + chrono::Duration::milliseconds(1)
            } else {
                wake
            };
            clock.sleep_until(wake).await;

            let messages = match self
                .inner
                .transport
                .search(&job.search_query(settings.dovecot_workaround))
                .await
            {
                Ok(messages) => messages,
                Err(e @ MailError::Auth(_)) => return Err(e),
                Err(e) => {
                    warn!("Mailbox search failed, will retry: {}", e);
                    continue;
                }
            };

            let candidates: Vec<_> = job.candidates(&messages).cloned().collect();
            debug!(
                "Mailbox search returned {} message(s), {} correlated",
                messages.len(),
                candidates.len()
            );
            for candidate in candidates {
                let Some(block) = extract_clearsigned(&candidate.body) else {
                    warn!("Ignoring mail reply without a clear-signed block");
                    continue;
                };
                let signer = match self.inner.verifier.verify(&block.armored).await {
                    Ok(signer) => signer,
                    Err(e) => {
                        warn!("Ignoring mail reply with bad signature: {}", e);
                        continue;
                    }
                };
                match job.accept(&candidate, &signer, &settings.keyid) {
                    Ok(receipt) => return Ok(receipt),
                    Err(e) => warn!("Ignoring mail reply: {}", e),
                }
            }
        }
    }
}

struct PendingGuard<'a>(&'a Mutex<Slot>);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        slot.pending = None;
    }
}

/// Object-safe view used by the orchestrator, so it does not need to carry
/// the transport, verifier and clock types.
pub trait MailCorroboration: Send + Sync {
    fn request(&self, digest: &str) -> bool;
    fn receipt(&self) -> Option<MailReceipt>;
    fn acknowledge(&self, receipt: &MailReceipt);
}

impl<T, V, C> MailCorroboration for MailNotary<T, V, C>
where
    T: MailTransport,
    V: SignatureVerifier,
    C: Clock,
{
    fn request(&self, digest: &str) -> bool {
        MailNotary::request(self, digest)
    }

    fn receipt(&self) -> Option<MailReceipt> {
        MailNotary::receipt(self)
    }

    fn acknowledge(&self, receipt: &MailReceipt) {
        MailNotary::acknowledge(self, receipt)
    }
}
