//! SMTP probe and a minimal client session, shared with e-mail notifications.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use super::{
    connect_tcp, ms, resolve_host, tls, Deadline, ProbeDriver, ProbeError, ProbeOutcome,
    DEFAULT_CERT_WARNING_DAYS,
};
use crate::check::{CheckDefinition, CheckKind, CheckTarget};
use crate::db::Timings;

/// Byte stream an SMTP session can run over, plain or TLS.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

#[derive(Debug, Clone, PartialEq)]
pub struct SmtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpReply {
    fn text(&self) -> String {
        self.lines.join(" ")
    }
}

pub struct SmtpSession {
    stream: BufReader<Box<dyn AsyncStream>>,
    host: String,
}

impl SmtpSession {
    /// Wrap a connected stream and consume the 220 greeting.
    pub async fn connect(stream: Box<dyn AsyncStream>, host: &str) -> Result<Self, ProbeError> {
        let mut session = Self {
            stream: BufReader::new(stream),
            host: host.to_string(),
        };
        let greeting = session.read_reply().await?;
        if greeting.code != 220 {
            return Err(ProbeError::Protocol(format!(
                "unexpected greeting: {} {}",
                greeting.code,
                greeting.text()
            )));
        }
        Ok(session)
    }

    async fn read_reply(&mut self) -> Result<SmtpReply, ProbeError> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self
                .stream
                .read_line(&mut line)
                .await
                .map_err(|e| ProbeError::Network(e.to_string()))?;
            if n == 0 {
                return Err(ProbeError::Protocol("connection closed by server".to_string()));
            }
            let line = line.trim_end();
            let code: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| ProbeError::Protocol(format!("malformed reply: {:?}", line)))?;
            lines.push(line.get(4..).unwrap_or_default().to_string());
            // "250-..." continues, "250 ..." ends the reply
            if line.as_bytes().get(3) != Some(&b'-') {
                return Ok(SmtpReply { code, lines });
            }
        }
    }

    pub async fn command(&mut self, line: &str) -> Result<SmtpReply, ProbeError> {
        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .map_err(|e| ProbeError::Network(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| ProbeError::Network(e.to_string()))?;
        self.read_reply().await
    }

    async fn expect(&mut self, line: &str, code: u16, what: &str) -> Result<SmtpReply, ProbeError> {
        let reply = self.command(line).await?;
        if reply.code != code {
            return Err(ProbeError::Protocol(format!(
                "{} rejected: {} {}",
                what,
                reply.code,
                reply.text()
            )));
        }
        Ok(reply)
    }

    /// Returns the advertised extensions.
    pub async fn ehlo(&mut self, client_name: &str) -> Result<Vec<String>, ProbeError> {
        let reply = self.expect(&format!("EHLO {}", client_name), 250, "EHLO").await?;
        Ok(reply.lines.into_iter().skip(1).collect())
    }

    /// Upgrade the connection; returns the server certificate's expiry.
    pub async fn starttls(
        self,
        ignore_errors: bool,
    ) -> Result<(Self, Option<DateTime<Utc>>), ProbeError> {
        let mut this = self;
        this.expect("STARTTLS", 220, "STARTTLS").await?;
        let host = this.host.clone();
        let inner = this.stream.into_inner();
        let (tls_stream, not_after) = tls::handshake(inner, &host, ignore_errors).await?;
        let session = Self {
            stream: BufReader::new(Box::new(tls_stream)),
            host,
        };
        Ok((session, not_after))
    }

    pub async fn auth_login(&mut self, username: &str, password: &str) -> Result<(), ProbeError> {
        let b64 = &base64::engine::general_purpose::STANDARD;
        self.expect("AUTH LOGIN", 334, "AUTH LOGIN").await?;
        self.expect(&b64.encode(username), 334, "username").await?;
        self.expect(&b64.encode(password), 235, "authentication").await?;
        Ok(())
    }

    /// Submit one message. `data` is the full message with headers.
    pub async fn send_mail(
        &mut self,
        from: &str,
        recipients: &[String],
        data: &str,
    ) -> Result<(), ProbeError> {
        self.expect(&format!("MAIL FROM:<{}>", from), 250, "MAIL FROM").await?;
        for rcpt in recipients {
            let reply = self.command(&format!("RCPT TO:<{}>", rcpt)).await?;
            if reply.code != 250 && reply.code != 251 {
                return Err(ProbeError::Protocol(format!(
                    "recipient {} rejected: {} {}",
                    rcpt,
                    reply.code,
                    reply.text()
                )));
            }
        }
        self.expect("DATA", 354, "DATA").await?;

        let mut body = String::with_capacity(data.len() + 8);
        for line in data.lines() {
            // Dot-stuffing
            if line.starts_with('.') {
                body.push('.');
            }
            body.push_str(line);
            body.push_str("\r\n");
        }
        body.push('.');
        self.expect(&body, 250, "message").await?;
        Ok(())
    }

    pub async fn quit(mut self) -> Result<(), ProbeError> {
        // Some servers drop the connection without replying to QUIT.
        match self.command("QUIT").await {
            Ok(_) | Err(ProbeError::Protocol(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub struct SmtpDriver;

#[async_trait]
impl ProbeDriver for SmtpDriver {
    fn kind(&self) -> CheckKind {
        CheckKind::Smtp
    }

    async fn execute(
        &self,
        def: &CheckDefinition,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let CheckTarget::Smtp(target) = &def.target else {
            return Err(ProbeError::Config(format!("check {} is not an smtp check", def.id)));
        };

        let deadline = Deadline::new(timeout);
        let addr = resolve_host(&target.ip, target.port, &deadline).await?;
        let name_lookup = deadline.elapsed();

        let stream = connect_tcp(addr, &deadline).await?;
        let connect = deadline.elapsed();

        let host = target.ip.clone();
        let (app_connect, not_after) = deadline
            .run(async {
                let mut session = SmtpSession::connect(Box::new(stream), &host).await?;
                session.ehlo("rmon.local").await?;

                let mut app_connect = None;
                let mut not_after = None;
                if target.use_tls {
                    let (upgraded, expiry) = session.starttls(target.ignore_ssl_error).await?;
                    session = upgraded;
                    not_after = expiry;
                    app_connect = Some(deadline.elapsed());
                    session.ehlo("rmon.local").await?;
                }

                if let (Some(user), Some(pass)) = (&target.username, &target.password) {
                    session.auth_login(user, pass).await?;
                }
                session.quit().await?;
                Ok((app_connect, not_after))
            })
            .await?;

        let mut outcome = ProbeOutcome::ok(Timings {
            response_time: Some(deadline.elapsed_ms()),
            name_lookup: Some(ms(name_lookup)),
            connect: Some(ms(connect)),
            app_connect: app_connect.map(ms),
            ..Default::default()
        });
        outcome.meta.ssl_expire_date = not_after;
        outcome.check_certificate(DEFAULT_CERT_WARNING_DAYS);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckRequest;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Scripted server: answers each command with the next canned reply and
    /// hands back everything the client sent.
    async fn fake_server(greeting: &str, replies: Vec<&'static str>) -> (u16, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let greeting = greeting.to_string();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (read, mut write) = tokio::io::split(sock);
            let mut read = BufReader::new(read);
            write.write_all(greeting.as_bytes()).await.unwrap();
            let mut transcript = String::new();
            let mut in_data = false;
            let mut replies = replies.into_iter();
            loop {
                let mut line = String::new();
                if read.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                transcript.push_str(&line);
                if in_data {
                    if line != ".\r\n" {
                        continue;
                    }
                    in_data = false;
                }
                match replies.next() {
                    Some(reply) => {
                        in_data = reply.starts_with("354");
                        write.write_all(reply.as_bytes()).await.unwrap();
                    }
                    None => break,
                }
            }
            let mut rest = Vec::new();
            let _ = read.read_to_end(&mut rest).await;
            let _ = tx.send(transcript);
        });
        (port, rx)
    }

    fn smtp_def(port: u16, auth: bool) -> CheckDefinition {
        let creds = if auth {
            r#","username":"probe","password":"secret""#
        } else {
            ""
        };
        CheckRequest::parse(
            CheckKind::Smtp,
            format!(r#"{{"name":"s","ip":"127.0.0.1","port":{}{}}}"#, port, creds).as_bytes(),
        )
        .unwrap()
        .into_definition(1, None)
        .unwrap()
    }

    #[tokio::test]
    async fn test_smtp_probe_with_auth() {
        let (port, transcript) = fake_server(
            "220 mx.test ESMTP\r\n",
            vec![
                "250-mx.test\r\n250-AUTH LOGIN PLAIN\r\n250 8BITMIME\r\n",
                "334 VXNlcm5hbWU6\r\n",
                "334 UGFzc3dvcmQ6\r\n",
                "235 ok\r\n",
                "221 bye\r\n",
            ],
        )
        .await;

        let outcome = SmtpDriver
            .execute(&smtp_def(port, true), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.timings.connect.is_some());
        assert!(outcome.timings.app_connect.is_none());

        let transcript = transcript.await.unwrap();
        assert!(transcript.contains("EHLO rmon.local"));
        assert!(transcript.contains("cHJvYmU=")); // "probe"
        assert!(transcript.contains("QUIT"));
    }

    #[tokio::test]
    async fn test_smtp_auth_rejected() {
        let (port, _) = fake_server(
            "220 mx.test ESMTP\r\n",
            vec![
                "250 mx.test\r\n",
                "334 VXNlcm5hbWU6\r\n",
                "334 UGFzc3dvcmQ6\r\n",
                "535 5.7.8 bad credentials\r\n",
            ],
        )
        .await;

        let err = SmtpDriver
            .execute(&smtp_def(port, true), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("535"), "got {}", err);
    }

    #[tokio::test]
    async fn test_smtp_bad_greeting() {
        let (port, _) = fake_server("554 go away\r\n", vec![]).await;
        let err = SmtpDriver
            .execute(&smtp_def(port, false), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_send_mail_dot_stuffing() {
        let (port, transcript) = fake_server(
            "220 mx.test ESMTP\r\n",
            vec![
                "250 mx.test\r\n",
                "250 sender ok\r\n",
                "250 rcpt ok\r\n",
                "354 go ahead\r\n",
                "250 queued\r\n",
                "221 bye\r\n",
            ],
        )
        .await;

        let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut session = SmtpSession::connect(Box::new(stream), "127.0.0.1").await.unwrap();
        session.ehlo("rmon.local").await.unwrap();
        session
            .send_mail(
                "rmon@localhost",
                &["ops@example.com".to_string()],
                "Subject: test\r\n\r\n.hidden line\r\nbody",
            )
            .await
            .unwrap();
        session.quit().await.unwrap();

        let transcript = transcript.await.unwrap();
        assert!(transcript.contains("RCPT TO:<ops@example.com>"));
        assert!(transcript.contains("\r\n..hidden line\r\n"));
    }
}
