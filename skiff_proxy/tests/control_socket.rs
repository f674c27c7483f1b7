//! Round trip through the real control socket: daemon side serving, client
//! side sending, journal persisting in between.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use skiff_proxy::acme::CertQueue;
use skiff_proxy::control::{self, Command, ProxyContext};
use skiff_proxy::state::StateJournal;
use skiff_proxy::tls::CertStore;

#[tokio::test]
async fn commands_round_trip_over_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().to_path_buf();

    let ctx = Arc::new(ProxyContext {
        journal: Arc::new(StateJournal::load(&state_dir).unwrap()),
        certs: CertStore::new(),
        queue: CertQueue::new(),
        challenges: Arc::new(RwLock::new(HashMap::new())),
        certs_dir: state_dir.join("certs"),
    });

    let server_ctx = ctx.clone();
    let server_dir = state_dir.clone();
    tokio::spawn(async move {
        let _ = control::serve(server_ctx, &server_dir).await;
    });
    for _ in 0..100 {
        if state_dir.join(control::CONTROL_SOCKET).exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let deploy = control::send(
        &state_dir,
        &Command::Deploy {
            host: "example.com".to_owned(),
            target: "acme-web:3000".to_owned(),
            project: "acme".to_owned(),
            health_path: "/up".to_owned(),
            ssl: false,
        },
    )
    .await
    .unwrap();
    assert!(deploy.ok, "{}", deploy.message);
    assert!(deploy.message.contains("Route deployed successfully"));

    let list = control::send(&state_dir, &Command::List).await.unwrap();
    assert!(list.message.contains("example.com -> acme-web:3000"));

    // The mutation was persisted before the response came back.
    let reloaded = StateJournal::load(&state_dir).unwrap();
    assert!(reloaded.snapshot().await.find_route("example.com").is_some());

    let remove = control::send(
        &state_dir,
        &Command::Remove {
            host: "example.com".to_owned(),
        },
    )
    .await
    .unwrap();
    assert!(remove.ok);

    let empty = control::send(&state_dir, &Command::List).await.unwrap();
    assert!(empty.message.contains("no routes configured"));
}
