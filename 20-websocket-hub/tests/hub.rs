use std::{collections::BTreeSet, io};

use anyhow::Result;
use axum::extract::ws::Message;
use futures::stream;
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::sync::mpsc::error::TryRecvError;
use websocket_hub::{
    client::{Client, ClientId, Mailbox},
    connection::CloseReason,
    dispatch::read_loop,
    hub::{Hub, HubConfig, HubHandle},
    payload::Payload,
};

async fn join(hub: &HubHandle, capacity: usize) -> Result<(ClientId, Mailbox)> {
    let (client, mailbox) = Client::new(capacity);
    let id = client.id();
    hub.register(client).await?;
    Ok((id, mailbox))
}

#[tokio::test]
async fn membership_tracks_random_register_unregister_sequences() -> Result<()> {
    for seed in 0..16u64 {
        let hub = Hub::spawn(HubConfig::default());
        let handle = hub.handle();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut known: Vec<ClientId> = Vec::new();
        let mut expected = BTreeSet::new();
        let mut mailboxes = Vec::new();

        for _ in 0..64 {
            if known.is_empty() || rng.gen_bool(0.6) {
                let (id, mailbox) = join(&handle, 4).await?;
                known.push(id);
                expected.insert(id);
                mailboxes.push(mailbox);
            } else {
                // Picks from every id ever seen, so absent clients get unregistered too.
                let id = known[rng.gen_range(0..known.len())];
                handle.unregister(id).await?;
                expected.remove(&id);
            }
        }

        let members: BTreeSet<ClientId> = handle.members().await?.into_iter().collect();
        assert_eq!(members, expected, "seed {seed}");
        for mailbox in &mailboxes {
            assert_eq!(
                mailbox.is_closed(),
                !expected.contains(&mailbox.id()),
                "seed {seed}"
            );
        }
        hub.stop().await;
    }
    Ok(())
}

#[tokio::test]
async fn concurrent_unregisters_close_the_mailbox_once() -> Result<()> {
    let hub = Hub::spawn(HubConfig::default());
    let handle = hub.handle();
    let (id, mut mailbox) = join(&handle, 4).await?;
    let (other, _other_mailbox) = join(&handle, 4).await?;

    let first = tokio::spawn({
        let handle = handle.clone();
        async move { handle.unregister(id).await }
    });
    let second = tokio::spawn({
        let handle = handle.clone();
        async move { handle.unregister(id).await }
    });
    first.await??;
    second.await??;

    assert_eq!(handle.members().await?, vec![other]);
    assert_eq!(mailbox.recv().await, None);
    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_broadcasts_arrive_in_one_order_for_everyone() -> Result<()> {
    let hub = Hub::spawn(HubConfig::default());
    let handle = hub.handle();
    let mut mailboxes = Vec::new();
    for _ in 0..4 {
        mailboxes.push(join(&handle, 256).await?.1);
    }

    let publishers: Vec<_> = (0..4)
        .map(|publisher| {
            let handle = handle.clone();
            tokio::spawn(async move {
                for n in 0..25 {
                    handle.broadcast(format!("{publisher}:{n}").into()).await?;
                }
                Ok::<_, anyhow::Error>(())
            })
        })
        .collect();
    for publisher in publishers {
        publisher.await??;
    }
    handle.members().await?;

    let mut sequences = Vec::new();
    for mailbox in &mut mailboxes {
        let mut received = Vec::new();
        while let Ok(payload) = mailbox.try_recv() {
            received.push(payload);
        }
        sequences.push(received);
    }

    assert_eq!(sequences[0].len(), 100);
    for sequence in &sequences[1..] {
        assert_eq!(sequence, &sequences[0]);
    }
    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn scenario_single_client_gets_its_broadcast() -> Result<()> {
    let hub = Hub::spawn(HubConfig::default());
    let handle = hub.handle();
    let (_, mut alice) = join(&handle, 256).await?;

    handle.broadcast("hello".into()).await?;
    handle.members().await?;

    assert_eq!(alice.len(), 1);
    assert_eq!(alice.try_recv(), Ok(Payload::from("hello")));
    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn scenario_reader_fans_out_to_sender_and_peer() -> Result<()> {
    let hub = Hub::spawn(HubConfig::default());
    let handle = hub.handle();
    let (alice_id, mut alice) = join(&handle, 256).await?;
    let (_, mut bob) = join(&handle, 256).await?;
    handle.broadcast("earlier".into()).await?;

    let mut inbound = stream::iter(vec![Ok::<_, io::Error>(Message::Text("hi".into()))]);
    let reason = read_loop(&mut inbound, alice_id, &handle, None).await;
    handle.members().await?;

    assert_eq!(reason, CloseReason::PeerClosed);
    for mailbox in [&mut alice, &mut bob] {
        assert_eq!(mailbox.try_recv(), Ok(Payload::from("earlier")));
        assert_eq!(mailbox.try_recv(), Ok(Payload::from("hi")));
        assert_eq!(mailbox.try_recv(), Err(TryRecvError::Empty));
    }
    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn scenario_undrained_client_is_evicted_on_third_broadcast() -> Result<()> {
    let hub = Hub::spawn(HubConfig::default());
    let handle = hub.handle();
    let (alice_id, alice) = join(&handle, 2).await?;

    handle.broadcast("1".into()).await?;
    handle.broadcast("2".into()).await?;
    assert!(handle.members().await?.contains(&alice_id));
    assert!(!alice.is_closed());

    handle.broadcast("3".into()).await?;

    assert!(!handle.members().await?.contains(&alice_id));
    assert!(alice.is_closed());
    assert_eq!(alice.len(), 2);
    hub.stop().await;
    Ok(())
}

#[tokio::test]
async fn scenario_broadcast_after_unregister_is_quietly_skipped() -> Result<()> {
    let hub = Hub::spawn(HubConfig::default());
    let handle = hub.handle();
    let (alice_id, mut alice) = join(&handle, 256).await?;

    handle.unregister(alice_id).await?;
    handle.broadcast("x".into()).await?;
    handle.members().await?;

    assert_eq!(alice.recv().await, None);
    hub.stop().await;
    Ok(())
}
