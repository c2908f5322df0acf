//! TLS 集成测试共用的证书、配置与回环拓扑。

#![allow(dead_code)]

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use rcgen::{CertifiedKey, generate_simple_self_signed};
use spark_altcp::{ConnId, Stack};
use spark_altcp_tcp::LoopbackNet;
use spark_altcp_tls::{TlsConfig, TlsOptions, new_tls};

pub type Log = Rc<RefCell<Vec<String>>>;

pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
}

/// 现场签发一张 `localhost` 自签名证书。
pub fn identity() -> Identity {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_string()]).expect("生成自签名证书");
    Identity {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    }
}

pub fn server_config(identity: &Identity, options: TlsOptions) -> TlsConfig {
    TlsConfig::server_from_pem(
        identity.cert_pem.as_bytes(),
        identity.key_pem.as_bytes(),
        options,
    )
    .expect("服务端配置")
}

/// 信任 `identity` 的客户端配置，默认服务器名称为 `localhost`。
pub fn client_config(identity: &Identity, options: TlsOptions) -> TlsConfig {
    let options = TlsOptions {
        server_name: Some("localhost".into()),
        ..options
    };
    TlsConfig::client_from_pem(identity.cert_pem.as_bytes(), options).expect("客户端配置")
}

/// 同一张证书构造的一对配置。
pub fn config_pair() -> (TlsConfig, TlsConfig) {
    let identity = identity();
    (
        server_config(&identity, TlsOptions::default()),
        client_config(&identity, TlsOptions::default()),
    )
}

/// 在回环网络上创建 TLS 监听连接。
pub fn tls_listener(net: &LoopbackNet, stack: &mut Stack, config: &TlsConfig) -> (ConnId, SocketAddr) {
    let id = new_tls(stack, config, Box::new(net.open())).expect("创建 TLS 监听连接");
    stack
        .bind(id, "127.0.0.1:0".parse().expect("地址字面量"))
        .expect("绑定");
    stack.listen(id, 4).expect("监听");
    let addr = stack.local_addr(id).expect("监听地址");
    (id, addr)
}

/// 记录收到的明文与 EOF，并立即确认。
pub fn recording_recv(log: Log) -> impl FnMut(&mut Stack, ConnId, Option<bytes::Bytes>) -> spark_altcp::Result<()> {
    move |stack, id, data| {
        match data {
            Some(bytes) => {
                log.borrow_mut()
                    .push(String::from_utf8_lossy(&bytes).into_owned());
                stack.recved(id, bytes.len());
            }
            None => log.borrow_mut().push("<eof>".into()),
        }
        Ok(())
    }
}

/// 服务端：每个接受的连接都记录数据，并把句柄放进 `accepted`。
pub fn recording_server(stack: &mut Stack, listener: ConnId, log: Log, accepted: Rc<RefCell<Vec<ConnId>>>) {
    stack
        .set_accept(listener, move |stack, _, new| {
            accepted.borrow_mut().push(new);
            stack.set_recv(new, recording_recv(log.clone()))
        })
        .expect("注册 accept");
}

/// 发起 TLS 连接；握手完成（而非 TCP 建连）时计数器加一。
pub fn tls_client(
    net: &LoopbackNet,
    stack: &mut Stack,
    config: &TlsConfig,
    addr: SocketAddr,
) -> (ConnId, Rc<RefCell<u32>>) {
    let id = new_tls(stack, config, Box::new(net.open())).expect("创建 TLS 客户端");
    let connected = Rc::new(RefCell::new(0));
    let counter = connected.clone();
    stack
        .connect_with(id, addr, move |_, _, result| {
            assert_eq!(result, Ok(()));
            *counter.borrow_mut() += 1;
        })
        .expect("发起连接");
    (id, connected)
}
