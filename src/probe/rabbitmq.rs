//! RabbitMQ probe: AMQP 0-9-1 connection handshake up to `Connection.Open-Ok`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
    connect_tcp, ms, resolve_host, tls, AsyncStream, Deadline, ProbeDriver, ProbeError,
    ProbeOutcome, DEFAULT_CERT_WARNING_DAYS,
};
use crate::check::{CheckDefinition, CheckKind, CheckTarget, RabbitTarget};
use crate::db::Timings;

const PROTOCOL_HEADER: &[u8] = b"AMQP\x00\x00\x09\x01";
const FRAME_METHOD: u8 = 1;
const FRAME_HEARTBEAT: u8 = 8;
const FRAME_END: u8 = 0xCE;

/// Connection class (10) methods.
const START: (u16, u16) = (10, 10);
const START_OK: (u16, u16) = (10, 11);
const TUNE: (u16, u16) = (10, 30);
const TUNE_OK: (u16, u16) = (10, 31);
const OPEN: (u16, u16) = (10, 40);
const OPEN_OK: (u16, u16) = (10, 41);
const CLOSE: (u16, u16) = (10, 50);
const CLOSE_OK: (u16, u16) = (10, 51);

pub struct RabbitDriver;

#[async_trait]
impl ProbeDriver for RabbitDriver {
    fn kind(&self) -> CheckKind {
        CheckKind::Rabbitmq
    }

    async fn execute(
        &self,
        def: &CheckDefinition,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ProbeError> {
        let CheckTarget::Rabbitmq(target) = &def.target else {
            return Err(ProbeError::Config(format!("check {} is not a rabbitmq check", def.id)));
        };

        let deadline = Deadline::new(timeout);
        let addr = resolve_host(&target.ip, target.port, &deadline).await?;
        let name_lookup = deadline.elapsed();

        let tcp = connect_tcp(addr, &deadline).await?;
        let connect = deadline.elapsed();

        let mut app_connect = None;
        let mut not_after = None;
        let mut stream: Box<dyn AsyncStream> = if target.use_tls {
            let (tls_stream, expiry) = deadline
                .run(tls::handshake(tcp, &target.ip, target.ignore_ssl_error))
                .await?;
            app_connect = Some(deadline.elapsed());
            not_after = expiry;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };

        deadline.run(handshake(&mut stream, target)).await?;

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

/// Open a connection on `vhost` with PLAIN credentials, then close it.
async fn handshake(stream: &mut Box<dyn AsyncStream>, target: &RabbitTarget) -> Result<(), ProbeError> {
    write(stream, PROTOCOL_HEADER).await?;

    expect_method(stream, START).await?;
    let mut args = Vec::new();
    put_table(&mut args, &[("product", "rmon")]);
    put_short_str(&mut args, "PLAIN");
    put_long_str(
        &mut args,
        format!("\0{}\0{}", target.username, target.password).as_bytes(),
    );
    put_short_str(&mut args, "en_US");
    send_method(stream, START_OK, &args).await?;

    let tune = expect_method(stream, TUNE).await?;
    // Echo channel_max and frame_max, decline heartbeats.
    let mut args = tune.get(..6).map(<[u8]>::to_vec).ok_or_else(short_frame)?;
    args.extend_from_slice(&0u16.to_be_bytes());
    send_method(stream, TUNE_OK, &args).await?;

    let mut args = Vec::new();
    put_short_str(&mut args, &target.vhost);
    put_short_str(&mut args, ""); // reserved
    args.push(0); // reserved bit
    send_method(stream, OPEN, &args).await?;
    expect_method(stream, OPEN_OK).await?;

    let mut args = Vec::new();
    args.extend_from_slice(&200u16.to_be_bytes());
    put_short_str(&mut args, "probe done");
    args.extend_from_slice(&[0, 0, 0, 0]);
    send_method(stream, CLOSE, &args).await?;
    // The check already passed; a missing Close-Ok is not a failure.
    let _ = expect_method(stream, CLOSE_OK).await;
    Ok(())
}

fn short_frame() -> ProbeError {
    ProbeError::Protocol("truncated AMQP frame".to_string())
}

fn io_err(e: std::io::Error) -> ProbeError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProbeError::Protocol("connection closed by broker".to_string())
    } else {
        ProbeError::Network(e.to_string())
    }
}

async fn write(stream: &mut Box<dyn AsyncStream>, bytes: &[u8]) -> Result<(), ProbeError> {
    stream.write_all(bytes).await.map_err(io_err)?;
    stream.flush().await.map_err(io_err)
}

fn put_short_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(255)];
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
}

fn put_long_str(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Field table of long-string values.
fn put_table(buf: &mut Vec<u8>, fields: &[(&str, &str)]) {
    let mut table = Vec::new();
    for (key, value) in fields {
        put_short_str(&mut table, key);
        table.push(b'S');
        put_long_str(&mut table, value.as_bytes());
    }
    put_long_str(buf, &table);
}

fn method_frame(method: (u16, u16), args: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + args.len());
    payload.extend_from_slice(&method.0.to_be_bytes());
    payload.extend_from_slice(&method.1.to_be_bytes());
    payload.extend_from_slice(args);

    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.push(FRAME_METHOD);
    frame.extend_from_slice(&0u16.to_be_bytes()); // channel 0
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame.push(FRAME_END);
    frame
}

async fn send_method(
    stream: &mut Box<dyn AsyncStream>,
    method: (u16, u16),
    args: &[u8],
) -> Result<(), ProbeError> {
    write(stream, &method_frame(method, args)).await
}

/// Read one frame, returning (type, payload).
async fn read_frame(stream: &mut Box<dyn AsyncStream>) -> Result<(u8, Vec<u8>), ProbeError> {
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await.map_err(io_err)?;

    // A broker rejecting our protocol version answers with its own header.
    if &header[..4] == b"AMQP" {
        return Err(ProbeError::Protocol("broker rejected the AMQP 0-9-1 protocol header".to_string()));
    }

    let size = u32::from_be_bytes([header[3], header[4], header[5], header[6]]) as usize;
    if size > 1 << 20 {
        return Err(ProbeError::Protocol(format!("frame of {} bytes is too large", size)));
    }
    let mut payload = vec![0u8; size + 1];
    stream.read_exact(&mut payload).await.map_err(io_err)?;
    if payload.pop() != Some(FRAME_END) {
        return Err(ProbeError::Protocol("missing frame end marker".to_string()));
    }
    Ok((header[0], payload))
}

/// Wait for `method` on channel 0 and return its arguments.
async fn expect_method(
    stream: &mut Box<dyn AsyncStream>,
    method: (u16, u16),
) -> Result<Vec<u8>, ProbeError> {
    loop {
        let (frame_type, payload) = read_frame(stream).await?;
        if frame_type == FRAME_HEARTBEAT {
            continue;
        }
        if frame_type != FRAME_METHOD || payload.len() < 4 {
            return Err(ProbeError::Protocol(format!("unexpected frame type {}", frame_type)));
        }
        let got = (
            u16::from_be_bytes([payload[0], payload[1]]),
            u16::from_be_bytes([payload[2], payload[3]]),
        );
        if got == method {
            return Ok(payload[4..].to_vec());
        }
        if got == CLOSE {
            return Err(close_error(&payload[4..]));
        }
        return Err(ProbeError::Protocol(format!(
            "expected method {}.{}, got {}.{}",
            method.0, method.1, got.0, got.1
        )));
    }
}

/// Turn a broker `Connection.Close` into an error carrying its reply.
fn close_error(args: &[u8]) -> ProbeError {
    let code = args
        .get(..2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .unwrap_or_default();
    let text = args
        .get(2)
        .and_then(|&len| args.get(3..3 + len as usize))
        .map(|t| String::from_utf8_lossy(t).into_owned())
        .unwrap_or_default();
    ProbeError::Protocol(format!("broker closed connection: {} {}", code, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::CheckRequest;
    use tokio::net::{TcpListener, TcpStream};

    async fn server_read_frame(sock: &mut TcpStream) -> (u16, u16, Vec<u8>) {
        let mut header = [0u8; 7];
        sock.read_exact(&mut header).await.unwrap();
        let size = u32::from_be_bytes([header[3], header[4], header[5], header[6]]) as usize;
        let mut payload = vec![0u8; size + 1];
        sock.read_exact(&mut payload).await.unwrap();
        payload.pop();
        (
            u16::from_be_bytes([payload[0], payload[1]]),
            u16::from_be_bytes([payload[2], payload[3]]),
            payload[4..].to_vec(),
        )
    }

    /// Broker that accepts the `guest` login on vhost `/`.
    async fn fake_broker() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 8];
            sock.read_exact(&mut header).await.unwrap();
            assert_eq!(&header, PROTOCOL_HEADER);

            // Start: version 0-9, empty properties, mechanisms, locales
            let mut start = vec![0, 9];
            put_long_str(&mut start, &[]);
            put_long_str(&mut start, b"PLAIN AMQPLAIN");
            put_long_str(&mut start, b"en_US");
            sock.write_all(&method_frame(START, &start)).await.unwrap();

            let (_, _, start_ok) = server_read_frame(&mut sock).await;
            let accepted = start_ok.windows(12).any(|w| w == b"\0guest\0guest");

            if !accepted {
                let mut close = 403u16.to_be_bytes().to_vec();
                put_short_str(&mut close, "ACCESS_REFUSED");
                close.extend_from_slice(&[0, 10, 0, 11]);
                sock.write_all(&method_frame(CLOSE, &close)).await.unwrap();
                return;
            }

            let mut tune = Vec::new();
            tune.extend_from_slice(&2047u16.to_be_bytes());
            tune.extend_from_slice(&131072u32.to_be_bytes());
            tune.extend_from_slice(&60u16.to_be_bytes());
            sock.write_all(&method_frame(TUNE, &tune)).await.unwrap();
            let (_, method, _) = server_read_frame(&mut sock).await;
            assert_eq!(method, TUNE_OK.1);

            let (_, method, open) = server_read_frame(&mut sock).await;
            assert_eq!(method, OPEN.1);
            assert_eq!(&open[..2], &[1, b'/']);
            // Heartbeat before Open-Ok must be skipped.
            sock.write_all(&[FRAME_HEARTBEAT, 0, 0, 0, 0, 0, 0, FRAME_END]).await.unwrap();
            sock.write_all(&method_frame(OPEN_OK, &[0])).await.unwrap();

            let (_, method, _) = server_read_frame(&mut sock).await;
            assert_eq!(method, CLOSE.1);
            sock.write_all(&method_frame(CLOSE_OK, &[])).await.unwrap();
        });
        port
    }

    fn rabbit_def(port: u16, password: &str) -> CheckDefinition {
        CheckRequest::parse(
            CheckKind::Rabbitmq,
            format!(
                r#"{{"name":"r","ip":"127.0.0.1","port":{},"password":"{}"}}"#,
                port, password
            )
            .as_bytes(),
        )
        .unwrap()
        .into_definition(1, None)
        .unwrap()
    }

    #[tokio::test]
    async fn test_rabbit_handshake() {
        let port = fake_broker().await;
        let outcome = RabbitDriver
            .execute(&rabbit_def(port, "guest"), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.timings.response_time.is_some());
    }

    #[tokio::test]
    async fn test_rabbit_access_refused() {
        let port = fake_broker().await;
        let err = RabbitDriver
            .execute(&rabbit_def(port, "wrong"), Duration::from_secs(2))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("403") && msg.contains("ACCESS_REFUSED"), "got {}", msg);
    }

    #[test]
    fn test_method_frame_layout() {
        let frame = method_frame(OPEN_OK, &[0]);
        assert_eq!(frame[0], FRAME_METHOD);
        assert_eq!(&frame[3..7], &5u32.to_be_bytes());
        assert_eq!(&frame[7..11], &[0, 10, 0, 41]);
        assert_eq!(*frame.last().unwrap(), FRAME_END);
    }
}
