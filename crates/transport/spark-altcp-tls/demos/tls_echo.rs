//! TLS 回显演示：在确定性回环网络上跑一个回显服务端与一个客户端。
//!
//! # 使用方法
//! ```bash
//! RUST_LOG=spark_altcp_tls=debug cargo run -p spark-altcp-tls --example tls_echo -- "hello tls"
//! ```
//!
//! # 设计要点（Why）
//! - 展示应用如何只面向通用连接 API 编程：服务端与客户端代码中没有任何 TLS 细节，
//!   是否加密完全由 [`TransportSelector`] 决定；
//! - 证书由 `rcgen` 现场签发，演示不依赖磁盘上的密钥材料。

use std::cell::RefCell;
use std::env;
use std::rc::Rc;

use anyhow::{Context, anyhow};
use rcgen::{CertifiedKey, generate_simple_self_signed};
use spark_altcp::{ConnId, Stack, WriteFlags};
use spark_altcp_tcp::LoopbackNet;
use spark_altcp_tls::{TlsConfig, TlsOptions, TransportSelector, tls_context};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let message = env::args().nth(1).unwrap_or_else(|| "hello over tls".to_string());
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_string()]).context("签发自签名证书")?;
    let server_cfg = TlsConfig::server_from_pem(
        cert.pem().as_bytes(),
        key_pair.serialize_pem().as_bytes(),
        TlsOptions::default(),
    )?;
    let client_options = TlsOptions::from_toml_str(
        r#"
        server_name = "localhost"
        alpn_protocols = ["echo/1"]
        "#,
    )?;
    let client_cfg = TlsConfig::client_from_pem(cert.pem().as_bytes(), client_options)?;

    let net = LoopbackNet::default();
    let mut stack = Stack::new();
    let listener = TransportSelector::Tls(server_cfg).new_conn(&mut stack, Box::new(net.open()))?;
    stack.bind(listener, "127.0.0.1:4433".parse()?)?;
    stack.listen(listener, 8)?;
    stack.set_accept(listener, |stack, _, new| {
        info!(conn = %new, "echo session accepted");
        stack.set_recv(new, echo)
    })?;

    let client = TransportSelector::Tls(client_cfg).new_conn(&mut stack, Box::new(net.open()))?;
    let reply = Rc::new(RefCell::new(Vec::new()));
    {
        let reply = reply.clone();
        stack.set_recv(client, move |stack, id, data| {
            match data {
                Some(bytes) => {
                    reply.borrow_mut().extend_from_slice(&bytes);
                    stack.recved(id, bytes.len());
                }
                None => stack.close(id)?,
            }
            Ok(())
        })?;
    }
    let payload = message.clone();
    stack.connect_with(client, "127.0.0.1:4433".parse()?, move |stack, id, result| {
        if let Err(err) = result.and_then(|()| stack.write(id, payload.as_bytes(), WriteFlags::COPY)) {
            tracing::error!(conn = %id, error = %err, "echo client could not send");
        }
    })?;
    net.run(&mut stack);

    let info = tls_context(&stack, client).ok_or_else(|| anyhow!("客户端连接未建立 TLS 会话"))?;
    info!(
        version = info.protocol_version.as_deref().unwrap_or("-"),
        suite = info.cipher_suite.as_deref().unwrap_or("-"),
        "negotiated"
    );
    stack.close(client)?;
    net.run(&mut stack);

    let echoed = String::from_utf8(reply.take())?;
    anyhow::ensure!(echoed == message, "回显内容不一致：{echoed:?}");
    println!("{echoed}");
    Ok(())
}

/// 服务端回显：收到多少写回多少，对端关闭后一并关闭。
fn echo(stack: &mut Stack, id: ConnId, data: Option<bytes::Bytes>) -> spark_altcp::Result<()> {
    match data {
        Some(bytes) => {
            stack.write(id, &bytes, WriteFlags::COPY)?;
            stack.recved(id, bytes.len());
            Ok(())
        }
        None => stack.close(id),
    }
}
