use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

use super::{ChannelSender, SenderError};
use crate::config::MailConfig;
use crate::db::{ChannelConfig, ChannelKind};
use crate::notify::Alert;
use crate::probe::{connect_tcp, resolve_host, Deadline, ProbeError, SmtpSession};

const MAIL_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends alerts through the configured SMTP relay.
pub struct EmailSender {
    mail: MailConfig,
    app_name: String,
}

impl EmailSender {
    pub fn new(mail: MailConfig, app_name: &str) -> Self {
        Self {
            mail,
            app_name: app_name.to_string(),
        }
    }

    fn message(&self, alert: &Alert, recipients: &[String]) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: [{}] {}\r\nDate: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            self.mail.from,
            recipients.join(", "),
            self.app_name,
            alert.headline(),
            Utc::now().to_rfc2822(),
            alert.body().replace('\n', "\r\n"),
        )
    }

    async fn deliver(&self, host: &str, recipients: &[String], data: &str) -> Result<(), ProbeError> {
        let deadline = Deadline::new(MAIL_TIMEOUT);
        let addr = resolve_host(host, self.mail.port, &deadline).await?;
        let stream = connect_tcp(addr, &deadline).await?;

        deadline
            .run(async {
                let mut session = SmtpSession::connect(Box::new(stream), host).await?;
                session.ehlo("rmon.local").await?;
                if self.mail.starttls {
                    let (upgraded, _) = session.starttls(false).await?;
                    session = upgraded;
                    session.ehlo("rmon.local").await?;
                }
                if let (Some(user), Some(pass)) = (&self.mail.user, &self.mail.password) {
                    session.auth_login(user, pass).await?;
                }
                session.send_mail(&self.mail.from, recipients, data).await?;
                session.quit().await
            })
            .await
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    async fn send(&self, config: &ChannelConfig, alert: &Alert) -> Result<(), SenderError> {
        let ChannelConfig::Email { recipients } = config else {
            return Err(SenderError::wrong_config(ChannelKind::Email, config));
        };
        if recipients.is_empty() {
            return Err(SenderError::InvalidConfiguration(
                "email channel has no recipients".to_string(),
            ));
        }
        let Some(host) = self.mail.host.as_deref() else {
            return Err(SenderError::InvalidConfiguration(
                "mail relay is not configured (RMON_MAIL_HOST)".to_string(),
            ));
        };

        let data = self.message(alert, recipients);
        self.deliver(host, recipients, &data)
            .await
            .map_err(|e| SenderError::SendFailed(format!("smtp relay {}: {}", host, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::tests::alert;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_email_through_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (read, mut write) = tokio::io::split(sock);
            let mut read = BufReader::new(read);
            write.write_all(b"220 relay ESMTP\r\n").await.unwrap();
            let mut transcript = String::new();
            let mut in_data = false;
            loop {
                let mut line = String::new();
                if read.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                transcript.push_str(&line);
                let reply: &[u8] = if in_data {
                    if line != ".\r\n" {
                        continue;
                    }
                    in_data = false;
                    b"250 queued\r\n"
                } else if line.starts_with("DATA") {
                    in_data = true;
                    b"354 go ahead\r\n"
                } else if line.starts_with("QUIT") {
                    write.write_all(b"221 bye\r\n").await.unwrap();
                    break;
                } else {
                    b"250 ok\r\n"
                };
                write.write_all(reply).await.unwrap();
            }
            transcript
        });

        let sender = EmailSender::new(
            MailConfig {
                host: Some("127.0.0.1".to_string()),
                port,
                starttls: false,
                ..Default::default()
            },
            "RMON",
        );
        let config = ChannelConfig::Email {
            recipients: vec!["ops@example.com".to_string()],
        };
        sender.send(&config, &alert()).await.unwrap();

        let transcript = server.await.unwrap();
        assert!(transcript.contains("MAIL FROM:<rmon@localhost>"));
        assert!(transcript.contains("RCPT TO:<ops@example.com>"));
        assert!(transcript.contains("Subject: [RMON] web is DOWN"));
    }

    #[tokio::test]
    async fn test_unconfigured_relay() {
        let sender = EmailSender::new(MailConfig::default(), "RMON");
        let config = ChannelConfig::Email {
            recipients: vec!["ops@example.com".to_string()],
        };
        let err = sender.send(&config, &alert()).await.unwrap_err();
        assert!(err.is_permanent());
    }
}
