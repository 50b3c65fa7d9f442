//! End-to-end checks that exercise the public API across module
//! boundaries, rather than any single module in isolation.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use codegate_proxy::ca::CertificateAuthority;
use codegate_proxy::pipeline::pii::{RedactingStep, RegexPiiAnalyzer};
use codegate_proxy::pipeline::{Pipeline, PipelineContext};
use codegate_proxy::routes::{extract_proxy_ep, RouteTable};
use codegate_proxy::session::SessionStore;
use codegate_proxy::streaming::{unredact_text, OutputContext, OutputStep, PiiUnredactionStep};
use codegate_proxy::tls;
use codegate_proxy::wire::{parse_connect_target, parse_request_head, ParseOutcome};
use serde_json::json;
use tempfile::tempdir;

#[test]
fn route_table_resolves_provider_paths_and_proxy_ep_overrides() {
    let mut providers = HashMap::new();
    providers.insert("openai".to_string(), "https://api.openai.com/v1".to_string());
    providers.insert("anthropic".to_string(), "https://api.anthropic.com".to_string());
    let table = RouteTable::from_provider_base_urls(&providers).unwrap();

    let resolved = table.resolve("/openai/chat/completions").unwrap();
    assert_eq!(resolved.as_str(), "https://api.openai.com/v1/chat/completions");

    assert!(table.resolve("/unknown/path").is_none());

    let overridden = extract_proxy_ep("Bearer sk-abc; proxy-ep=internal-llm:9443").unwrap();
    assert_eq!(overridden.as_str(), "https://internal-llm:9443/");
}

#[test]
fn wire_parser_splits_a_pipelined_buffer_into_head_and_remaining_bytes() {
    let buf = b"POST /openai/chat/completions HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhelloGET / HTTP/1.1\r\n\r\n";
    let ParseOutcome::Complete { head, consumed } = parse_request_head(buf).unwrap() else {
        panic!("expected a complete head");
    };
    assert_eq!(head.method, "POST");
    assert_eq!(head.content_length(), Some(5));
    assert_eq!(&buf[consumed..consumed + 5], b"hello");

    let (host, port) = parse_connect_target("api.anthropic.com:443").unwrap();
    assert_eq!(host, "api.anthropic.com");
    assert_eq!(port, 443);
}

#[tokio::test]
async fn ca_mints_a_leaf_that_a_real_rustls_handshake_accepts() {
    let dir = tempdir().unwrap();
    let ca = CertificateAuthority::load_or_generate(&dir.path().join("ca.crt"), &dir.path().join("ca.key"), false).unwrap();
    let leaf = ca.get_leaf("api.example.internal").await.unwrap();
    let server_config = tls::server_config_for_leaf(&leaf).unwrap();

    // An always-accept client config stands in for "the client trusts the
    // CodeGate root" without needing to install it into a system store
    // inside the test sandbox; the handshake itself (cert parsing, key
    // exchange, ALPN negotiation) still runs for real.
    let client_config = tls::build_client_config(false).unwrap();

    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
    let connector = tokio_rustls::TlsConnector::from(client_config);

    let server = tokio::spawn(async move { acceptor.accept(server_io).await });
    let server_name = rustls::pki_types::ServerName::try_from("api.example.internal").unwrap();
    let client = connector.connect(server_name, client_io).await.unwrap();
    let server = server.await.unwrap().unwrap();

    assert_eq!(
        client.get_ref().1.alpn_protocol(),
        server.get_ref().1.alpn_protocol()
    );
}

#[tokio::test]
async fn pii_is_redacted_on_the_way_in_and_restored_on_the_way_out() {
    let store = SessionStore::new(Duration::from_secs(60));
    let step = RedactingStep::new(Arc::new(RegexPiiAnalyzer::new()));
    let pipeline = Pipeline::new(vec![Arc::new(step)]);

    let request = json!({
        "messages": [{"role": "user", "content": "my email is jane@example.com, please remember it"}]
    });
    let context = PipelineContext::new("req-1".into(), "sess-1".into());

    let (rewritten, context, shortcircuit) = pipeline.run(request, context, &store).await;
    assert!(shortcircuit.is_none());

    let redacted_text = rewritten["messages"][1]["content"].as_str().unwrap().to_string();
    assert!(!redacted_text.contains("jane@example.com"));
    assert_eq!(context.metadata["redacted_pii_count"], json!(1));

    // Simulate the upstream echoing the placeholder back across two
    // streamed response chunks, split in the middle of the UUID.
    let split = redacted_text.len() / 2;
    let (first_half, second_half) = redacted_text.split_at(split);

    let unredact_step = PiiUnredactionStep;
    let mut output_context = OutputContext::new();

    let chunk_a = json!({"choices": [{"delta": {"content": first_half}}]});
    let emitted_a = unredact_step
        .process(chunk_a, &mut output_context, &context, &store)
        .await;
    let chunk_b = json!({"choices": [{"delta": {"content": second_half}}]});
    let emitted_b = unredact_step
        .process(chunk_b, &mut output_context, &context, &store)
        .await;

    let text_a = emitted_a[0].pointer("/choices/0/delta/content").unwrap().as_str().unwrap();
    let text_b = emitted_b[0].pointer("/choices/0/delta/content").unwrap().as_str().unwrap();
    let reassembled = format!("{text_a}{text_b}");
    assert!(reassembled.contains("jane@example.com"));
}

#[test]
fn unredact_text_passes_through_text_with_no_placeholders() {
    let store = SessionStore::new(Duration::from_secs(60));
    let mut prefix = String::new();
    let out = unredact_text(&mut prefix, "nothing redacted here", &store, "sess-1");
    assert_eq!(out, "nothing redacted here");
    assert!(prefix.is_empty());
}
