mod common;

use common::*;
use std::sync::Arc;

use zeitgitter_daemon::clock::{Clock, ManualClock};
use zeitgitter_daemon::error::MailError;
use zeitgitter_daemon::mail::{MailNotary, MailSettings};

const DIGEST: &str = "0123456789abcdef0123456789abcdef01234567";
const OTHER_DIGEST: &str = "89abcdef0123456789abcdef0123456789abcdef";

fn mail_settings(dovecot_workaround: bool) -> MailSettings {
    MailSettings {
        own_address: "stamps@example.org".to_string(),
        service_address: "clock@stamper.itconsult.co.uk".to_string(),
        reply_from: STAMPER_FROM.to_string(),
        keyid: STAMPER_KEYID.to_string(),
        window: chrono::Duration::minutes(15),
        poll: chrono::Duration::minutes(1),
        dovecot_workaround,
    }
}

fn build_notary(
    mailbox: FakeMailbox,
    clock: &Arc<ManualClock>,
    settings: MailSettings,
) -> (
    MailNotary<SharedMailbox, FakeVerifier, ManualClock>,
    Arc<FakeMailbox>,
) {
    let mailbox = Arc::new(mailbox);
    let notary = MailNotary::new(
        SharedMailbox(mailbox.clone()),
        FakeVerifier,
        clock.clone(),
        settings,
    );
    (notary, mailbox)
}

#[tokio::test]
async fn test_reply_inside_window_is_received() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mut mailbox = FakeMailbox::new(clock.clone());
    mailbox.auto_reply_after = Some(chrono::Duration::seconds(150));
    let (notary, mailbox) = build_notary(mailbox, &clock, mail_settings(true));

    let receipt = notary.timestamp(DIGEST).await.unwrap().unwrap();
    assert_eq!(receipt.digest, DIGEST);
    assert_eq!(receipt.signer, STAMPER_KEY);
    assert_eq!(receipt.received_at, at(12, 2, 30));

    let sent = mailbox.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "clock@stamper.itconsult.co.uk");
    assert_eq!(sent[0].subject, format!("Timestamp {}", DIGEST));
    assert!(sent[0].message_id.ends_with("@example.org>"));

    // Polled once a minute until the reply showed up
    assert_eq!(clock.now(), at(12, 3, 0));
    assert!(!notary.is_pending());
    assert_eq!(notary.take_receipt(), Some(receipt));
    assert_eq!(notary.take_receipt(), None);
}

/// **Property: late mail replies expire**
///
/// A reply that arrives after the search window has closed never turns
/// into a receipt; the job ends Expired at the window end.
#[tokio::test]
async fn test_late_reply_expires() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mut mailbox = FakeMailbox::new(clock.clone());
    mailbox.auto_reply_after = Some(chrono::Duration::minutes(20));
    let (notary, _mailbox) = build_notary(mailbox, &clock, mail_settings(true));

    let result = notary.timestamp(DIGEST).await.unwrap();
    match result {
        Err(MailError::Expired { window_end }) => assert_eq!(window_end, at(12, 15, 0)),
        other => panic!("expected expiry, got {:?}", other),
    }
    assert!(clock.now() > at(12, 15, 0));
    assert!(clock.now() < at(12, 16, 0));
    assert_eq!(notary.take_receipt(), None);
    assert!(!notary.is_pending());
}

#[tokio::test]
async fn test_reply_dated_before_request_is_ignored() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mailbox = FakeMailbox::new(clock.clone());
    let (notary, mailbox) = build_notary(mailbox, &clock, mail_settings(true));

    // Already in the mailbox, but stamped outside our window
    mailbox.deliver(stamper_reply(DIGEST, at(11, 59, 0)));

    let result = notary.timestamp(DIGEST).await.unwrap();
    assert!(matches!(result, Err(MailError::Expired { .. })));
}

#[tokio::test]
async fn test_dovecot_workaround_truncates_query_only() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mut mailbox = FakeMailbox::new(clock.clone());
    mailbox.dovecot_bug = true;
    mailbox.auto_reply_after = Some(chrono::Duration::minutes(2));
    let (notary, mailbox) = build_notary(mailbox, &clock, mail_settings(true));

    let receipt = notary.timestamp(DIGEST).await.unwrap().unwrap();
    assert_eq!(receipt.digest, DIGEST);

    let queries = mailbox.queries.lock().unwrap().clone();
    assert!(!queries.is_empty());
    assert!(queries
        .iter()
        .all(|q| q.from == "mailer@stamper.itconsult.co.u" && q.since == at(12, 0, 0)));
}

#[tokio::test]
async fn test_buggy_server_without_workaround_finds_nothing() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mut mailbox = FakeMailbox::new(clock.clone());
    mailbox.dovecot_bug = true;
    mailbox.auto_reply_after = Some(chrono::Duration::minutes(2));
    let (notary, mailbox) = build_notary(mailbox, &clock, mail_settings(false));

    let result = notary.timestamp(DIGEST).await.unwrap();
    assert!(matches!(result, Err(MailError::Expired { .. })));
    assert!(mailbox
        .queries
        .lock()
        .unwrap()
        .iter()
        .all(|q| q.from == STAMPER_FROM));
}

/// The truncated search also matches look-alike senders; only the exact
/// reply address is accepted.
#[tokio::test]
async fn test_lookalike_sender_is_rejected() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mailbox = FakeMailbox::new(clock.clone());
    let (notary, mailbox) = build_notary(mailbox, &clock, mail_settings(true));
    mailbox.deliver(stamper_reply_from(
        "mailer@stamper.itconsult.co.uk.evil.example",
        DIGEST,
        at(12, 1, 0),
    ));
    mailbox.deliver(stamper_reply_from(
        "mailer@stamper.itconsult.co.u",
        DIGEST,
        at(12, 1, 0),
    ));

    let result = notary.timestamp(DIGEST).await.unwrap();
    assert!(matches!(result, Err(MailError::Expired { .. })));
}

#[tokio::test]
async fn test_reply_for_other_digest_is_ignored() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mailbox = FakeMailbox::new(clock.clone());
    let (notary, mailbox) = build_notary(mailbox, &clock, mail_settings(true));
    mailbox.deliver(stamper_reply(OTHER_DIGEST, at(12, 1, 0)));
    mailbox.deliver(stamper_reply(DIGEST, at(12, 4, 0)));

    let receipt = notary.timestamp(DIGEST).await.unwrap().unwrap();
    assert_eq!(receipt.received_at, at(12, 4, 0));
}

#[tokio::test]
async fn test_wrong_signer_is_not_accepted() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mut mailbox = FakeMailbox::new(clock.clone());
    mailbox.auto_reply_after = Some(chrono::Duration::minutes(1));
    let mut settings = mail_settings(true);
    settings.keyid = "DEADBEEF".to_string();
    let (notary, _mailbox) = build_notary(mailbox, &clock, settings);

    let result = notary.timestamp(DIGEST).await.unwrap();
    assert!(matches!(result, Err(MailError::Expired { .. })));
}

#[tokio::test]
async fn test_unsigned_reply_is_not_accepted() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mailbox = FakeMailbox::new(clock.clone());
    let (notary, mailbox) = build_notary(mailbox, &clock, mail_settings(true));
    let mut reply = stamper_reply(DIGEST, at(12, 1, 0));
    reply.body = format!("{}\n", DIGEST);
    mailbox.deliver(reply);

    let result = notary.timestamp(DIGEST).await.unwrap();
    assert!(matches!(result, Err(MailError::Expired { .. })));
}

#[tokio::test]
async fn test_auth_failure_abandons_job() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mut mailbox = FakeMailbox::new(clock.clone());
    mailbox.auth_fails = true;
    let (notary, mailbox) = build_notary(mailbox, &clock, mail_settings(true));

    let result = notary.timestamp(DIGEST).await.unwrap();
    assert!(matches!(result, Err(MailError::Auth(_))));
    // Gave up at the first poll instead of retrying until the window end
    assert_eq!(clock.now(), at(12, 1, 0));
    assert!(mailbox.queries.lock().unwrap().is_empty());
    assert!(!notary.is_pending());
}

/// **Property: at most one mail job at a time**
///
/// While a request is outstanding, further requests are refused without
/// sending anything. Once it completes, a new one may start.
#[tokio::test]
async fn test_mutual_exclusion() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mut mailbox = FakeMailbox::new(clock.clone());
    mailbox.auto_reply_after = Some(chrono::Duration::minutes(3));
    let (notary, mailbox) = build_notary(mailbox, &clock, mail_settings(true));

    assert!(notary.request(DIGEST));
    assert!(notary.is_pending());
    assert!(!notary.request(OTHER_DIGEST));
    assert!(notary.timestamp(OTHER_DIGEST).await.is_none());

    for _ in 0..1000 {
        if !notary.is_pending() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!notary.is_pending());
    assert_eq!(mailbox.sent().len(), 1);
    assert_eq!(notary.take_receipt().map(|r| r.digest), Some(DIGEST.to_string()));

    assert!(notary.timestamp(OTHER_DIGEST).await.is_some());
    assert_eq!(mailbox.sent().len(), 2);
}

/// A job that dies mid-flight must not leave the slot claimed, or every
/// later request would be refused.
#[tokio::test]
async fn test_crashed_job_releases_slot() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mut mailbox = FakeMailbox::new(clock.clone());
    mailbox.search_panics = true;
    let (notary, mailbox) = build_notary(mailbox, &clock, mail_settings(true));

    assert!(notary.request(DIGEST));
    for _ in 0..1000 {
        if !notary.is_pending() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!notary.is_pending());
    assert_eq!(notary.take_receipt(), None);

    assert!(notary.request(OTHER_DIGEST));
    for _ in 0..1000 {
        if mailbox.sent().len() == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(mailbox.sent().len(), 2);
}

#[tokio::test]
async fn test_receipt_stays_until_acknowledged() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mut mailbox = FakeMailbox::new(clock.clone());
    mailbox.auto_reply_after = Some(chrono::Duration::minutes(1));
    let (notary, _mailbox) = build_notary(mailbox, &clock, mail_settings(true));

    let receipt = notary.timestamp(DIGEST).await.unwrap().unwrap();
    assert_eq!(notary.receipt(), Some(receipt.clone()));
    assert_eq!(notary.receipt(), Some(receipt.clone()));

    let mut other = receipt.clone();
    other.digest = OTHER_DIGEST.to_string();
    notary.acknowledge(&other);
    assert_eq!(notary.receipt(), Some(receipt.clone()));

    notary.acknowledge(&receipt);
    assert_eq!(notary.receipt(), None);
}

#[tokio::test]
async fn test_digest_outside_signed_block_is_not_accepted() {
    let clock = Arc::new(ManualClock::new(at(12, 0, 0)));
    let mailbox = FakeMailbox::new(clock.clone());
    let (notary, mailbox) = build_notary(mailbox, &clock, mail_settings(true));
    let mut reply = stamper_reply("old receipt for deadbeef", at(12, 1, 0));
    reply.subject = format!("Re: Timestamp {}", DIGEST);
    reply.body.push_str(&format!("\n{}\n", DIGEST));
    mailbox.deliver(reply);

    let result = notary.timestamp(DIGEST).await.unwrap();
    assert!(matches!(result, Err(MailError::Expired { .. })));
}
