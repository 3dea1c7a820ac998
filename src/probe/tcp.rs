//! TCP connect probe.

use async_trait::async_trait;
use std::time::Duration;

use super::{connect_tcp, ms, resolve_host, Deadline, ProbeDriver, ProbeError, ProbeOutcome};
use crate::check::{CheckDefinition, CheckKind, CheckTarget};
use crate::db::Timings;

pub struct TcpDriver;

#[async_trait]
impl ProbeDriver for TcpDriver {
    fn kind(&self) -> CheckKind {
        CheckKind::Tcp
    }

    async fn execute(
        &self,
        def: &CheckDefinition,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let CheckTarget::Tcp(target) = &def.target else {
            return Err(ProbeError::Config(format!("check {} is not a tcp check", def.id)));
        };

        let deadline = Deadline::new(timeout);
        let addr = resolve_host(&target.ip, target.port, &deadline).await?;
        let name_lookup = deadline.elapsed();

        let stream = connect_tcp(addr, &deadline).await?;
        let connect = deadline.elapsed();
        drop(stream);

        Ok(ProbeOutcome::ok(Timings {
            response_time: Some(ms(connect)),
            name_lookup: Some(ms(name_lookup)),
            connect: Some(ms(connect)),
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckRequest;
    use tokio::net::TcpListener;

    fn tcp_def(port: u16) -> CheckDefinition {
        CheckRequest::parse(
            CheckKind::Tcp,
            format!(r#"{{"name":"t","ip":"127.0.0.1","port":{}}}"#, port).as_bytes(),
        )
        .unwrap()
        .into_definition(1, None)
        .unwrap()
    }

    #[tokio::test]
    async fn test_tcp_probe_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let outcome = TcpDriver
            .execute(&tcp_def(port), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.timings.connect.is_some());
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let err = TcpDriver
            .execute(&tcp_def(port), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Refused(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_tcp_probe_timeout_is_not_refused() {
        // A listener that never accepts, with its queue filled: further SYNs
        // are dropped, so the connect hangs until the deadline.
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(0).unwrap();
        let addr = listener.local_addr().unwrap();
        let fillers: Vec<_> = (0..4)
            .map(|_| tokio::spawn(tokio::net::TcpStream::connect(addr)))
            .collect();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let timeout = Duration::from_millis(300);
        let err = TcpDriver
            .execute(&tcp_def(addr.port()), timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(t) if t == timeout), "got {:?}", err);
        assert!(!matches!(err, ProbeError::Refused(_)));
        assert!(err.to_string().contains("timed out"), "{}", err);

        for f in fillers {
            f.abort();
        }
        drop(listener);
    }
}
