//! Certificate lifecycle end-to-end tests
//!
//! DNS propagation and ACME issuance are scripted; everything between the
//! control plane and the SNI store is the real thing.

use std::time::Duration;

use serde_json::Value;
use sitehost_common::load_certs_from_pem;
use sitehost_core::{DnsStatus, SslStatus};
use sitehost_e2e::harness::CONTACT_EMAIL;
use sitehost_e2e::{init_test, wait_for, TestServer, TestServerOptions};
use sitehost_server::RenewReport;

const WAIT: Duration = Duration::from_secs(3);

async fn wait_for_ssl(server: &TestServer, subdomain: &str, status: SslStatus) -> bool {
    wait_for(WAIT, || server.tenant(subdomain).ssl_status() == status).await
}

async fn set_custom_domain(server: &TestServer, subdomain: &str, domain: Option<&str>) -> u16 {
    let id = server.tenant(subdomain).id;
    reqwest::Client::new()
        .put(server.control_url(&format!("/tenants/{}/custom-domain", id)))
        .json(&serde_json::json!({ "custom_domain": domain }))
        .send()
        .await
        .expect("Control plane request failed")
        .status()
        .as_u16()
}

#[tokio::test]
async fn test_certificate_issued_after_dns_propagates() {
    init_test();
    let server = TestServer::start().await;
    server.dns.propagate("shop.example");

    let resp = server.create_tenant("shop", Some("Shop.Example")).await;
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["custom_domain"], "shop.example");
    assert_eq!(created["dns_status"], "pending");
    assert_eq!(created["ssl_status"], "none");

    assert!(wait_for_ssl(&server, "shop", SslStatus::Active).await);

    let tenant = server.tenant("shop");
    assert_eq!(tenant.dns_status(), DnsStatus::Ok);
    assert_eq!(tenant.certificate.ssl_error, None);
    assert_eq!(
        server.acme.issued(),
        vec![("shop.example".to_string(), CONTACT_EMAIL.to_string())]
    );
    assert_eq!(server.reloads.count(), 1);
    assert_eq!(server.notifier.count_containing("Certificate issued"), 1);
    assert!(server.store.contains("shop.example"));
    assert!(server.store.contains("www.shop.example"));

    // The later scheduled checks find the domain verified and do nothing
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(server.acme.attempt_count(), 1);
    assert_eq!(server.reloads.count(), 1);
}

#[tokio::test]
async fn test_https_gate_presents_issued_certificate() {
    init_test();
    let server = TestServer::start().await;
    server.dns.propagate("shop.example");
    server.create_tenant("shop", Some("shop.example")).await;
    assert!(wait_for_ssl(&server, "shop", SslStatus::Active).await);

    let pem = std::fs::read_to_string(server.live_dir().join("shop.example").join("fullchain.pem"))
        .unwrap();
    let expected = load_certs_from_pem(&pem).unwrap().remove(0);

    let (leaf, status_line) = server.https_get("shop.example").await;
    assert_eq!(leaf, expected);
    assert!(status_line.contains("200"), "got {:?}", status_line);

    let (leaf, _) = server.https_get("www.shop.example").await;
    assert_eq!(leaf, expected);
}

#[tokio::test]
async fn test_late_propagation_recovers_from_dns_error() {
    init_test();
    let server = TestServer::start().await;

    server.create_tenant("shop", Some("shop.example")).await;
    assert!(
        wait_for(WAIT, || server.tenant("shop").dns_status() == DnsStatus::Error).await
    );
    let tenant = server.tenant("shop");
    assert!(tenant.certificate.dns_error.is_some());
    assert_eq!(tenant.ssl_status(), SslStatus::None);

    server.dns.propagate("shop.example");
    assert!(wait_for_ssl(&server, "shop", SslStatus::Active).await);
    assert_eq!(server.tenant("shop").certificate.dns_error, None);
    assert_eq!(server.acme.issued().len(), 1);
}

#[tokio::test]
async fn test_issuance_retries_then_succeeds() {
    init_test();
    let server = TestServer::start().await;
    server.dns.propagate("shop.example");
    server.acme.fail_next_issues(2);

    server.create_tenant("shop", Some("shop.example")).await;
    assert!(wait_for_ssl(&server, "shop", SslStatus::Active).await);

    assert_eq!(server.acme.attempt_count(), 3);
    assert_eq!(server.acme.issued().len(), 1);
    assert_eq!(server.notifier.count_containing("issuance failed"), 0);
    assert_eq!(server.tenant("shop").certificate.ssl_error, None);
}

#[tokio::test]
async fn test_issuance_gives_up_after_three_attempts() {
    init_test();
    let server = TestServer::start().await;
    server.dns.propagate("shop.example");
    server.acme.fail_next_issues(100);

    server.create_tenant("shop", Some("shop.example")).await;

    let acme = server.acme.clone();
    assert!(wait_for(WAIT, || acme.attempt_count() == 3).await);
    assert!(wait_for_ssl(&server, "shop", SslStatus::Error).await);

    let notifier = server.notifier.clone();
    assert!(
        wait_for(WAIT, || notifier.count_containing("Certificate issuance failed") == 1).await
    );

    // No further attempts once the retries are spent
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(server.acme.attempt_count(), 3);
    assert_eq!(server.notifier.count_containing("Certificate issuance failed"), 1);

    let tenant = server.tenant("shop");
    assert_eq!(tenant.dns_status(), DnsStatus::Ok);
    let error = tenant.certificate.ssl_error.unwrap_or_default();
    assert!(error.contains("Challenge failed"), "got {:?}", error);
    assert_eq!(server.reloads.count(), 0);
}

#[tokio::test]
async fn test_domain_change_supersedes_pending_checks() {
    init_test();
    let server = TestServer::start_with(TestServerOptions {
        dns_check_offsets: vec![Duration::from_millis(150), Duration::from_millis(300)],
        ..Default::default()
    })
    .await;
    server.dns.propagate("old.example");
    server.dns.propagate("new.example");

    server.create_tenant("shop", Some("old.example")).await;
    assert_eq!(set_custom_domain(&server, "shop", Some("new.example")).await, 200);

    assert!(wait_for_ssl(&server, "shop", SslStatus::Active).await);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let issued: Vec<String> = server.acme.issued().into_iter().map(|(d, _)| d).collect();
    assert_eq!(issued, vec!["new.example".to_string()]);
    assert_eq!(
        server.tenant("shop").custom_domain.as_deref(),
        Some("new.example")
    );
}

#[tokio::test]
async fn test_clearing_domain_stops_lifecycle() {
    init_test();
    let server = TestServer::start_with(TestServerOptions {
        dns_check_offsets: vec![Duration::from_millis(200)],
        ..Default::default()
    })
    .await;
    server.dns.propagate("shop.example");

    server.create_tenant("shop", Some("shop.example")).await;
    assert_eq!(set_custom_domain(&server, "shop", None).await, 200);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let tenant = server.tenant("shop");
    assert_eq!(tenant.custom_domain, None);
    assert_eq!(tenant.ssl_status(), SslStatus::None);
    assert_eq!(server.acme.attempt_count(), 0);
}

#[tokio::test]
async fn test_renew_all_reloads_only_when_renewed() {
    init_test();
    let server = TestServer::start().await;
    server.dns.propagate("shop.example");
    server.create_tenant("shop", Some("shop.example")).await;
    assert!(wait_for_ssl(&server, "shop", SslStatus::Active).await);
    let reloads = server.reloads.count();

    // Nothing due
    server.worker.renew_all().await.unwrap();
    assert_eq!(server.reloads.count(), reloads);

    server.acme.set_renew_report(RenewReport {
        renewed: vec!["shop.example".to_string()],
        failed: vec![],
    });
    server.worker.renew_all().await.unwrap();
    assert_eq!(server.reloads.count(), reloads + 1);
    assert_eq!(server.tenant("shop").ssl_status(), SslStatus::Active);

    server.acme.set_renew_report(RenewReport {
        renewed: vec![],
        failed: vec!["shop.example".to_string()],
    });
    let report = server.worker.renew_all().await.unwrap();
    assert_eq!(report.failed_count(), 1);
    assert_eq!(server.reloads.count(), reloads + 1);

    let tenant = server.tenant("shop");
    assert_eq!(tenant.ssl_status(), SslStatus::Error);
    assert!(tenant.certificate.ssl_error.is_some());
    assert!(server.notifier.count_containing("Certificate renewal") >= 2);
}

#[tokio::test]
async fn test_registry_survives_restart() {
    init_test();
    let server = TestServer::start().await;
    server.dns.propagate("shop.example");
    server.create_tenant("shop", Some("shop.example")).await;
    assert!(wait_for_ssl(&server, "shop", SslStatus::Active).await);

    let reopened = sitehost_server::JsonFileRegistry::open(server.registry.path()).unwrap();
    let tenants = sitehost_core::TenantRegistry::list(&reopened).unwrap();
    assert_eq!(tenants.len(), 1);
    assert_eq!(tenants[0].ssl_status(), SslStatus::Active);
    assert_eq!(tenants[0].custom_domain.as_deref(), Some("shop.example"));
}

#[tokio::test]
async fn test_single_renewal_via_control_plane() {
    init_test();
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    server.create_tenant("shop", Some("shop.example")).await;
    let id = server.tenant("shop").id;
    let url = server.control_url(&format!("/tenants/{}/renewal", id));

    // Nothing to renew before the certificate is active
    assert_eq!(client.post(&url).send().await.unwrap().status(), 409);

    server.dns.propagate("shop.example");
    assert!(wait_for_ssl(&server, "shop", SslStatus::Active).await);
    let reloads = server.reloads.count();

    let resp = client.post(&url).send().await.unwrap();
    assert_eq!(resp.status(), 202);
    let scheduled: Value = resp.json().await.unwrap();
    assert_eq!(scheduled["job"]["kind"], "renew");

    let acme = server.acme.clone();
    assert!(wait_for(WAIT, || acme.renewed() == vec!["shop.example".to_string()]).await);
    let counter = server.reloads.clone();
    assert!(wait_for(WAIT, || counter.count() == reloads + 1).await);
    assert_eq!(server.tenant("shop").ssl_status(), SslStatus::Active);
}
