// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end exercise of a single (peerless) authority: start a server
//! in a tempdir, feed it descriptors over HTTP, and watch the bootstrap
//! document publish.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use dirauth_client::{Client, ClientError};
use dirauth_common::epochtime::{Epoch, EpochClock, SystemClock};
use dirauth_common::pki::{
    IdentityKeypair, LinkPublicKey, MixDescriptor, MixKey, LAYER_PROVIDER,
};
use dirauth_common::wire;
use dirauth_server::{Config, Server};
use slog::{o, Logger};
use tempfile::TempDir;

struct TestAuthority {
    server: Server,
    client: Client,
    data_dir: Utf8PathBuf,
    mixes: Vec<IdentityKeypair>,
    provider: IdentityKeypair,
    _dir: TempDir,
}

fn test_log() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn signed_descriptor(
    keypair: &IdentityKeypair,
    name: &str,
    epoch: Epoch,
    layer: u8,
) -> Vec<u8> {
    let mut mix_keys = BTreeMap::new();
    mix_keys.insert(epoch, MixKey::from_bytes([7; 32]));
    mix_keys.insert(epoch.next(), MixKey::from_bytes([8; 32]));
    let descriptor = MixDescriptor {
        name: name.to_string(),
        identity_key: keypair.public(),
        link_key: LinkPublicKey::from_bytes([9; 32]),
        mix_keys,
        addresses: vec![format!("tcp://{name}.example.net:31337")],
        layer,
    };
    wire::sign_descriptor(keypair, &descriptor).unwrap()
}

async fn start_authority() -> Result<TestAuthority> {
    let dir = tempfile::tempdir().context("creating tempdir")?;
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .expect("tempdir path is UTF-8");
    let data_dir = root.join("data");

    let mixes = vec![IdentityKeypair::generate(), IdentityKeypair::generate()];
    let provider = IdentityKeypair::generate();

    let mut config = format!(
        r#"
        [server]
        data_dir = "{data_dir}"
        addresses = ["[::1]:0"]
        layers = 2

        [parameters]
        lambda = 0.00025
        lambda_prime = 0.0003
        max_delay = 90000

        [log]
        mode = "stderr-terminal"
        level = "error"

        [dropshot]
        request_body_max_bytes = 1048576

        [[providers]]
        name = "provider1"
        identity_key = "{provider_key}"
        "#,
        provider_key = provider.public(),
    );
    for mix in &mixes {
        config.push_str(&format!(
            "\n[[mixes]]\nidentity_key = \"{}\"\n",
            mix.public()
        ));
    }
    let config_path = root.join("config.toml");
    std::fs::write(&config_path, config).context("writing config")?;

    let config = Config::from_file(&config_path).context("loading config")?;
    let log = test_log();
    let server =
        Server::start(config, &log).await.context("starting server")?;
    let addr = server.local_addrs()[0];
    let client = Client::new(&format!("http://{addr}"), &log)
        .context("building client")?;

    Ok(TestAuthority { server, client, data_dir, mixes, provider, _dir: dir })
}

async fn wait_for_document(client: &Client, epoch: Epoch) -> Result<Vec<u8>> {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match client.get_document_raw(epoch).await {
                Ok(raw) => return Ok(raw),
                Err(ClientError::NotYet(_)) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(err) => {
                    return Err(err).context("fetching bootstrap document")
                }
            }
        }
    })
    .await
    .context("timed out waiting for the bootstrap document")?
}

fn status_of(err: ClientError) -> u16 {
    match err {
        ClientError::Status { status, .. } => status.as_u16(),
        other => panic!("expected an HTTP status error, got {other}"),
    }
}

#[tokio::test]
async fn bootstrap_document_published_once_all_nodes_upload() -> Result<()> {
    let authority = start_authority().await?;
    let now = SystemClock.now().epoch;

    // Nothing published yet: the current (bootstrap) epoch reports
    // not-yet, so clients know to poll.
    assert!(matches!(
        authority.client.get_document_raw(now).await,
        Err(ClientError::NotYet(_))
    ));

    let mut mix_uploads = Vec::new();
    for (i, mix) in authority.mixes.iter().enumerate() {
        let raw = signed_descriptor(mix, &format!("mix{}", i + 1), now, 0);
        authority.client.post_descriptor(now, &raw).await?;
        // Idempotent resubmission is accepted.
        authority.client.post_descriptor(now, &raw).await?;
        mix_uploads.push(raw);
    }
    let raw = signed_descriptor(
        &authority.provider,
        "provider1",
        now,
        LAYER_PROVIDER,
    );
    authority.client.post_descriptor(now, &raw).await?;

    let raw = wait_for_document(&authority.client, now).await?;

    // The published document verifies under the key the server generated
    // on first start.
    let keypair = IdentityKeypair::load_or_generate(
        &authority.data_dir.join("identity.key"),
    )
    .context("reading authority key")?;
    let doc =
        wire::verify_and_parse_document(&raw, &keypair.public(), now)
            .context("verifying published document")?;
    assert_eq!(doc.epoch, now);
    assert_eq!(doc.topology.iter().map(Vec::len).sum::<usize>(), 2);
    assert_eq!(doc.providers.len(), 1);
    assert_eq!(doc.providers[0].name, "provider1");

    // The verified client path agrees.
    let parsed = authority.client.get_document(now, &keypair.public()).await?;
    assert_eq!(parsed, doc);

    // Publication does not break idempotence: resubmitting bytes that
    // were already accepted stays a no-op.
    authority.client.post_descriptor(now, &mix_uploads[0]).await?;
    // But different bytes for an already-recorded identity are still a
    // conflict.
    let renege = signed_descriptor(&authority.mixes[0], "mix1-v2", now, 0);
    let err =
        authority.client.post_descriptor(now, &renege).await.unwrap_err();
    assert_eq!(status_of(err), 409);

    authority.server.close().await?;
    Ok(())
}

#[tokio::test]
async fn rejected_uploads_map_to_distinct_statuses() -> Result<()> {
    let authority = start_authority().await?;
    let now = SystemClock.now().epoch;

    // Conflicting re-upload: same identity, different bytes.
    let first = signed_descriptor(&authority.mixes[0], "mix1", now, 0);
    authority.client.post_descriptor(now, &first).await?;
    let second = signed_descriptor(&authority.mixes[0], "mix1-v2", now, 0);
    let err = authority.client.post_descriptor(now, &second).await.unwrap_err();
    assert_eq!(status_of(err), 409);

    // A key outside the authorization tables.
    let stranger = signed_descriptor(
        &IdentityKeypair::generate(),
        "mix9",
        now,
        0,
    );
    let err = authority.client.post_descriptor(now, &stranger).await.unwrap_err();
    assert_eq!(status_of(err), 403);

    // A provider under a name other than its registered one.
    let misnamed = signed_descriptor(
        &authority.provider,
        "not-provider1",
        now,
        LAYER_PROVIDER,
    );
    let err = authority.client.post_descriptor(now, &misnamed).await.unwrap_err();
    assert_eq!(status_of(err), 403);

    // An epoch outside the accepting window.
    let far = Epoch(now.0 + 3);
    let future = signed_descriptor(&authority.mixes[1], "mix2", far, 0);
    let err = authority.client.post_descriptor(far, &future).await.unwrap_err();
    assert_eq!(status_of(err), 400);

    // Unparseable bytes.
    let err = authority.client.post_descriptor(now, b"junk").await.unwrap_err();
    assert_eq!(status_of(err), 400);

    // A document request too far ahead to reason about.
    let err = authority.client.get_document_raw(far).await.unwrap_err();
    assert_eq!(status_of(err), 400);

    authority.server.close().await?;
    Ok(())
}
