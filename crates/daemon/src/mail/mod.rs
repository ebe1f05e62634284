//! Legacy mail notary: counter-timestamping through a stamping service that
//! answers e-mail with a PGP-signed receipt.
//!
//! A job moves `Idle → Sent → (Received | Expired)`. [`MailNotaryJob`] holds
//! the pure correlation and expiry rules; [`notary::MailNotary`] drives it
//! against a [`MailTransport`] in the background.

pub mod notary;
pub mod transport;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use uuid::Uuid;

use crate::error::MailError;
use crate::signature::{extract_clearsigned, signer_matches};

pub use notary::{MailNotary, MailSettings};
pub use transport::SmtpImapTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub message_id: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Bare address, without display name.
    pub from: String,
    pub subject: String,
    pub in_reply_to: Option<String>,
    pub received_at: DateTime<Utc>,
    pub body: String,
}

/// Server-side search. Matching here is only a pre-filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailQuery {
    pub from: String,
    pub since: DateTime<Utc>,
}

pub trait MailTransport: Send + Sync + 'static {
    fn send(&self, message: &OutboundMessage) -> impl Future<Output = Result<(), MailError>> + Send;

    fn search(
        &self,
        query: &MailQuery,
    ) -> impl Future<Output = Result<Vec<InboundMessage>, MailError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailStatus {
    Pending,
    Received,
    Expired,
}

/// A verified counter-signature from the mail notary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailReceipt {
    pub digest: String,
    pub signer: String,
    pub received_at: DateTime<Utc>,
    pub signed_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailNotaryJob {
    pub digest: String,
    pub reference: String,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
    pub reply_from: String,
    pub search_window_end: DateTime<Utc>,
    pub status: MailStatus,
}

impl MailNotaryJob {
    pub fn new(
        digest: &str,
        own_address: &str,
        reply_from: &str,
        sent_at: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Self {
        let domain = own_address
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or("localhost");
        Self {
            digest: digest.to_string(),
            reference: format!("<{}@{}>", Uuid::new_v4(), domain),
            subject: format!("Timestamp {}", digest),
            sent_at,
            reply_from: reply_from.to_string(),
            search_window_end: sent_at + window,
            status: MailStatus::Pending,
        }
    }

    pub fn outbound(&self, own_address: &str, service_address: &str) -> OutboundMessage {
        OutboundMessage {
            from: own_address.to_string(),
            to: service_address.to_string(),
            subject: self.subject.clone(),
            message_id: self.reference.clone(),
            body: format!("{}\n", self.digest),
        }
    }

    /// Some IMAP servers (Dovecot) fail to match the final character of an
    /// address in SEARCH FROM. With the workaround the query drops it; the
    /// full address is still required by [`Self::correlates`].
    pub fn search_query(&self, dovecot_workaround: bool) -> MailQuery {
        let mut from = self.reply_from.clone();
        if dovecot_workaround {
            from.pop();
        }
        MailQuery {
            from,
            since: self.sent_at,
        }
    }

    /// Whether `message` is the reply to this job: sent from the exact reply
    /// address, inside the window, and tied to our request by reference or
    /// subject.
    pub fn correlates(&self, message: &InboundMessage) -> bool {
        if !message.from.eq_ignore_ascii_case(&self.reply_from) {
            return false;
        }
        if message.received_at < self.sent_at || message.received_at > self.search_window_end {
            return false;
        }
        let by_reference = message
            .in_reply_to
            .as_deref()
            .map(|r| r.trim() == self.reference)
            .unwrap_or(false);
        by_reference || message.subject.contains(&self.subject)
    }

    pub fn candidates<'a>(
        &self,
        messages: &'a [InboundMessage],
    ) -> impl Iterator<Item = &'a InboundMessage> + 'a {
        let job = self.clone();
        messages.iter().filter(move |m| job.correlates(m))
    }

    /// Accept a correlated reply whose clear-signed block was signed by
    /// `signer`. The digest has to appear inside the signed text.
    pub fn accept(
        &mut self,
        message: &InboundMessage,
        signer: &str,
        expected_keyid: &str,
    ) -> Result<MailReceipt, MailError> {
        if self.status != MailStatus::Pending {
            return Err(MailError::Unverifiable(format!(
                "job is already {:?}",
                self.status
            )));
        }
        if !self.correlates(message) {
            return Err(MailError::Unverifiable(
                "reply does not belong to this request".to_string(),
            ));
        }
        if !signer_matches(signer, expected_keyid) {
            return Err(MailError::Unverifiable(format!(
                "signed by {} instead of {}",
                signer, expected_keyid
            )));
        }
        let block = extract_clearsigned(&message.body).ok_or_else(|| {
            MailError::Unverifiable("reply carries no clear-signed block".to_string())
        })?;
        if !block.signed_text.contains(&self.digest) {
            return Err(MailError::Unverifiable(
                "signed text does not mention the digest".to_string(),
            ));
        }

        self.status = MailStatus::Received;
        Ok(MailReceipt {
            digest: self.digest.clone(),
            signer: signer.to_string(),
            received_at: message.received_at,
            signed_text: block.armored,
        })
    }

    /// Move to `Expired` once the window has closed. Returns true if the
    /// job is (now) expired.
    pub fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.status == MailStatus::Pending && now > self.search_window_end {
            self.status = MailStatus::Expired;
        }
        self.status == MailStatus::Expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DIGEST: &str = "0123456789abcdef0123456789abcdef01234567";
    const FPR: &str = "0123456789ABCDEF01231234ABCD70B61F81";

    fn job() -> MailNotaryJob {
        let sent = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        MailNotaryJob::new(
            DIGEST,
            "stamps@example.org",
            "mailer@stamper.itconsult.co.uk",
            sent,
            chrono::Duration::minutes(15),
        )
    }

    fn signed_body(text: &str) -> String {
        format!(
            "-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\n{}\n-----BEGIN PGP SIGNATURE-----\niQEz\n-----END PGP SIGNATURE-----\n",
            text
        )
    }

    fn reply(job: &MailNotaryJob, after: chrono::Duration) -> InboundMessage {
        InboundMessage {
            from: job.reply_from.clone(),
            subject: format!("Re: {}", job.subject),
            in_reply_to: None,
            received_at: job.sent_at + after,
            body: signed_body(DIGEST),
        }
    }

    #[test]
    fn test_reference_uses_own_domain() {
        let job = job();
        assert!(job.reference.ends_with("@example.org>"));
        assert_eq!(
            job.search_window_end - job.sent_at,
            chrono::Duration::minutes(15)
        );
    }

    #[test]
    fn test_dovecot_workaround_only_changes_query() {
        let job = job();
        assert_eq!(
            job.search_query(true).from,
            "mailer@stamper.itconsult.co.u"
        );
        assert_eq!(
            job.search_query(false).from,
            "mailer@stamper.itconsult.co.uk"
        );

        let mut impostor = reply(&job, chrono::Duration::minutes(1));
        impostor.from = "mailer@stamper.itconsult.co.u".to_string();
        assert!(!job.correlates(&impostor));
    }

    #[test]
    fn test_correlation_by_reference() {
        let job = job();
        let mut msg = reply(&job, chrono::Duration::minutes(2));
        msg.subject = "Your timestamp".to_string();
        assert!(!job.correlates(&msg));
        msg.in_reply_to = Some(job.reference.clone());
        assert!(job.correlates(&msg));
    }

    #[test]
    fn test_late_reply_never_received() {
        let mut job = job();
        let late = reply(&job, chrono::Duration::minutes(16));
        assert!(!job.correlates(&late));
        assert!(job.accept(&late, FPR, "70B61F81").is_err());
        assert!(job.expire_if_due(job.search_window_end + chrono::Duration::seconds(1)));
        assert_eq!(job.status, MailStatus::Expired);
    }

    #[test]
    fn test_reply_at_window_end_is_accepted() {
        let mut job = job();
        let edge = reply(&job, chrono::Duration::minutes(15));
        let receipt = job.accept(&edge, FPR, "70B61F81").unwrap();
        assert_eq!(receipt.digest, DIGEST);
        assert_eq!(job.status, MailStatus::Received);
        // A received job never expires afterwards
        assert!(!job.expire_if_due(job.search_window_end + chrono::Duration::hours(1)));
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let mut job = job();
        let msg = reply(&job, chrono::Duration::minutes(3));
        assert!(job.accept(&msg, "AAAABBBBCCCCDDDD", "70B61F81").is_err());
        assert_eq!(job.status, MailStatus::Pending);
    }

    #[test]
    fn test_digest_outside_signed_block_rejected() {
        let mut job = job();
        let mut msg = reply(&job, chrono::Duration::minutes(2));
        msg.body = format!("{}\n{}\n", signed_body("old receipt for deadbeef"), DIGEST);
        assert!(job.accept(&msg, FPR, "70B61F81").is_err());
        assert_eq!(job.status, MailStatus::Pending);

        msg.body = format!("> {}\n\n{}", DIGEST, signed_body("old receipt for deadbeef"));
        assert!(job.accept(&msg, FPR, "70B61F81").is_err());
    }

    #[test]
    fn test_receipt_keeps_only_armored_block() {
        let mut job = job();
        let mut msg = reply(&job, chrono::Duration::minutes(2));
        msg.body = format!("Thanks for using the service.\n\n{}-- \nfooter\n", signed_body(DIGEST));
        let receipt = job.accept(&msg, FPR, "70B61F81").unwrap();
        assert_eq!(receipt.signed_text, signed_body(DIGEST));
    }
}
