// Shared ClientHello fixtures for the integration tests
#![allow(dead_code)]

use modcipher_net::{hello, CipherSuite, Preferences};
use std::sync::Arc;

/// Builds a ClientHello record with an 8-byte session id and an SNI extension.
pub fn client_hello(suites: &[u16]) -> Vec<u8> {
    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x5a; 32]);
    body.push(8);
    body.extend_from_slice(&[0x11; 8]);
    body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
    for suite in suites {
        body.extend_from_slice(&suite.to_be_bytes());
    }
    body.extend_from_slice(&[0x01, 0x00]);
    // server_name extension for example.com
    let host = b"example.com";
    let mut ext = Vec::new();
    ext.extend_from_slice(&0x0000u16.to_be_bytes());
    ext.extend_from_slice(&((host.len() + 5) as u16).to_be_bytes());
    ext.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
    ext.push(0);
    ext.extend_from_slice(&(host.len() as u16).to_be_bytes());
    ext.extend_from_slice(host);
    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut handshake = vec![1];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![22, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

pub fn preferences(entries: &[(u16, i64)]) -> Arc<Preferences> {
    Arc::new(entries.iter().map(|&(id, score)| (CipherSuite(id), score)).collect())
}

pub fn suite_ids(record: &[u8]) -> Vec<u16> {
    hello::locate(record)
        .expect("record should be a ClientHello")
        .cipher_suites
        .iter()
        .map(|s| s.id())
        .collect()
}
