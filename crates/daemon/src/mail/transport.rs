use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use regex::Regex;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use super::{InboundMessage, MailQuery, MailTransport, OutboundMessage};
use crate::config::StamperConfig;
use crate::error::MailError;

const DEFAULT_SMTP_PORT: u16 = 587;
const DEFAULT_IMAP_PORT: u16 = 143;
/// Bound on every connect, read and write towards the mail servers
const IO_TIMEOUT: Duration = Duration::from_secs(60);

/// SMTP submission and IMAP search, both upgraded with STARTTLS. Servers
/// that only offer implicit TLS are not supported.
#[derive(Debug, Clone)]
pub struct SmtpImapTransport {
    smtp_host: String,
    smtp_port: u16,
    imap_host: String,
    imap_port: u16,
    username: String,
    password: String,
}

impl SmtpImapTransport {
    pub fn from_config(config: &StamperConfig) -> Result<Self, MailError> {
        let (smtp_host, smtp_port) = split_host_port(&config.smtp_server, DEFAULT_SMTP_PORT)?;
        let (imap_host, imap_port) = split_host_port(&config.imap_server, DEFAULT_IMAP_PORT)?;
        Ok(Self {
            smtp_host,
            smtp_port,
            imap_host,
            imap_port,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }
}

/// Split `host[:port]`.
pub fn split_host_port(server: &str, default_port: u16) -> Result<(String, u16), MailError> {
    let server = server.trim();
    match server.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| MailError::Transport(format!("invalid port in '{}'", server)))?;
            Ok((host.to_string(), port))
        }
        None if !server.is_empty() => Ok((server.to_string(), default_port)),
        _ => Err(MailError::Transport(format!(
            "invalid server address '{}'",
            server
        ))),
    }
}

fn looks_like_auth_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("535") || lower.contains("auth")
}

impl MailTransport for SmtpImapTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), MailError> {
        let from: Mailbox = message
            .from
            .parse()
            .map_err(|e| MailError::Transport(format!("bad sender address: {}", e)))?;
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|e| MailError::Transport(format!("bad recipient address: {}", e)))?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(message.subject.clone())
            .message_id(Some(message.message_id.clone()))
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| MailError::Transport(e.to_string()))?;

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.smtp_host)
            .map_err(|e| MailError::Transport(e.to_string()))?
            .port(self.smtp_port)
            .timeout(Some(IO_TIMEOUT))
            .credentials(Credentials::new(
                self.username.clone(),
                self.password.clone(),
            ))
            .build();

        debug!("Submitting mail to {}:{}", self.smtp_host, self.smtp_port);
        mailer.send(email).await.map(|_| ()).map_err(|e| {
            let text = e.to_string();
            if looks_like_auth_failure(&text) {
                MailError::Auth(text)
            } else {
                MailError::Transport(text)
            }
        })
    }

    async fn search(&self, query: &MailQuery) -> Result<Vec<InboundMessage>, MailError> {
        let this = self.clone();
        let query = query.clone();
        let search = tokio::task::spawn_blocking(move || this.search_blocking(&query));
        // The socket timeouts bound each exchange; this bounds the session
        tokio::time::timeout(IO_TIMEOUT * 3, search)
            .await
            .map_err(|_| MailError::Transport("IMAP session timed out".to_string()))?
            .map_err(|e| MailError::Transport(format!("IMAP task failed: {}", e)))?
    }
}

impl SmtpImapTransport {
    fn search_blocking(&self, query: &MailQuery) -> Result<Vec<InboundMessage>, MailError> {
        let transport_err = |e: imap::Error| MailError::Transport(e.to_string());

        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| MailError::Transport(e.to_string()))?;
        let io_err = |e: std::io::Error| {
            MailError::Transport(format!("{}:{}: {}", self.imap_host, self.imap_port, e))
        };
        let addr = (self.imap_host.as_str(), self.imap_port)
            .to_socket_addrs()
            .map_err(io_err)?
            .next()
            .ok_or_else(|| MailError::Transport(format!("cannot resolve {}", self.imap_host)))?;
        let stream = TcpStream::connect_timeout(&addr, IO_TIMEOUT).map_err(io_err)?;
        stream.set_read_timeout(Some(IO_TIMEOUT)).map_err(io_err)?;
        stream.set_write_timeout(Some(IO_TIMEOUT)).map_err(io_err)?;

        let mut client = imap::Client::new(stream);
        client.read_greeting().map_err(transport_err)?;
        let client = client
            .secure(&self.imap_host, &tls)
            .map_err(transport_err)?;

        let mut session = client
            .login(&self.username, &self.password)
            .map_err(|(e, _)| MailError::Auth(e.to_string()))?;

        session.select("INBOX").map_err(transport_err)?;

        let criteria = format!(
            "FROM \"{}\" SINCE {}",
            query.from.replace('"', ""),
            query.since.format("%d-%b-%Y")
        );
        debug!("IMAP SEARCH {}", criteria);
        let ids = session.search(&criteria).map_err(transport_err)?;

        let mut messages = Vec::new();
        if !ids.is_empty() {
            let mut ids: Vec<u32> = ids.into_iter().collect();
            ids.sort_unstable();
            let set = ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let fetches = session
                .fetch(set, "(INTERNALDATE BODY.PEEK[])")
                .map_err(transport_err)?;
            for fetch in fetches.iter() {
                let received_at = fetch.internal_date().map(|d| d.with_timezone(&Utc));
                if let (Some(raw), Some(received_at)) = (fetch.body(), received_at) {
                    if let Some(message) = parse_message(raw, received_at) {
                        messages.push(message);
                    }
                }
            }
        }

        let _ = session.logout();
        Ok(messages)
    }
}

fn angle_address_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([^<>\s]+)>").unwrap())
}

/// Parse the few headers correlation needs, plus the body.
pub fn parse_message(raw: &[u8], received_at: DateTime<Utc>) -> Option<InboundMessage> {
    let text = String::from_utf8_lossy(raw).replace("\r\n", "\n");
    let (head, body) = text.split_once("\n\n").unwrap_or((text.as_str(), ""));

    // Unfold continuation lines
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    let header = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.trim().to_string())
    };

    let from_raw = header("from")?;
    let from = angle_address_re()
        .captures(&from_raw)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| from_raw.trim().to_string());

    Some(InboundMessage {
        from,
        subject: header("subject").unwrap_or_default(),
        in_reply_to: header("in-reply-to"),
        received_at,
        body: body.to_string(),
    })
}
