//! End-to-end scenarios on hand-wired topologies
//!
//! Each test builds a small star (or a direct pair) of peers, replays a
//! couple of requests, and checks the observable timing and cache
//! behaviour. All timing assertions are in simulated seconds with wide
//! tolerances, so they hold at any reasonable acceleration.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use vcache_sim::{
    Client, ClientHooks, ClientSettings, Link, LinkParams, Packet, Payload, Peer, PeerCore,
    PeerId, PlayoutRecorder, Proxy, ProxyKind, SimContext, Video, VideoServer,
};

fn video(id: &str, size_kb: f64) -> Video {
    Video {
        id: id.to_string(),
        duration_s: 60,
        size_kb,
        bitrate_kb_s: size_kb / 60.0,
        title: "Video".into(),
        description: "A video".into(),
    }
}

/// Poll until `probe` returns `Some`, failing after ~10 wall seconds.
async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    for _ in 0..1000 {
        if let Some(value) = probe() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

fn recording_hooks(recorder: &Arc<PlayoutRecorder>, client_id: PeerId) -> ClientHooks {
    let start = recorder.clone();
    let play = recorder.clone();
    ClientHooks::new()
        .on_new_download(move |v| start.request_started(client_id, v))
        .on_start_playback(move |v| play.playback_started(client_id, v))
}

fn gauge_hooks(ctx: &Arc<SimContext>, hooks: ClientHooks) -> ClientHooks {
    let inc = ctx.clone();
    let dec = ctx.clone();
    hooks
        .on_new_download(move |_| inc.downloads.inc())
        .on_end_download(move |_| dec.downloads.dec())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_through_forward_proxy() {
    let ctx = Arc::new(SimContext::new(8.0, 1.0));
    let proxy = Arc::new(Proxy::forward(0, "Proxy"));
    let client = Arc::new(Client::new(
        1001,
        "c1",
        ClientSettings::default(),
        ClientHooks::new(),
        ctx.clone(),
    ));

    let params = LinkParams {
        latency_s: 1.0,
        bandwidth_kb_s: 1024.0,
        max_chunk_kb: 512.0,
    };
    client.connect_to(Link::to(proxy.clone(), params, ctx.clone()));
    proxy.connect_to(1001, Link::to(client.clone(), params, ctx.clone()));

    client.request("lol");
    ctx.clock.sleep(3.0).await;

    let last = client.last_received().expect("client never got a reply");
    assert_eq!(last.payload, Payload::Text("There you go: lol".into()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_direct_transfer_time() {
    // Direct client-server pair: expected playout latency is about
    // 2 * 0.1s latency + 8192 kb / 2048 kb/s = 4.2 simulated seconds.
    let ctx = Arc::new(SimContext::new(6.0, 1.0));
    let recorder = Arc::new(PlayoutRecorder::new(ctx.clone()));

    let client = Arc::new(Client::new(
        1004,
        "c4",
        ClientSettings::default(),
        recording_hooks(&recorder, 1004),
        ctx.clone(),
    ));
    let server = Arc::new(VideoServer::new(2, "s2"));
    server.add_video(video("1337", 8192.0));

    let params = LinkParams {
        latency_s: 0.1,
        bandwidth_kb_s: 2048.0,
        max_chunk_kb: 32000.0,
    };
    client.connect_to(Link::to(server.clone(), params, ctx.clone()));
    server.connect_to(Link::to(client.clone(), params, ctx.clone()));

    client.request_media("1337", 2);

    let latency = wait_for(|| recorder.latencies_for(1004).first().copied()).await;
    assert!(
        latency > 4.0 && latency < 5.0,
        "playout latency {latency} outside (4, 5)"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fifo_reuse_beats_congested_origin() {
    // A pulls the video over a congested origin link; B asks 3 simulated
    // seconds later and is served out of the cache on the fast client side.
    let ctx = Arc::new(SimContext::new(8.0, 1.0));
    let recorder = Arc::new(PlayoutRecorder::new(ctx.clone()));
    let proxy = Arc::new(Proxy::new(0, "Proxy", ProxyKind::Fifo, 4096.0));

    let client_params = LinkParams {
        latency_s: 0.1,
        bandwidth_kb_s: 8192.0,
        max_chunk_kb: 16000.0,
    };
    let server_params = LinkParams {
        latency_s: 0.1,
        bandwidth_kb_s: 1024.0,
        max_chunk_kb: 16000.0,
    };

    let mut clients = Vec::new();
    for id in [1001u64, 1002u64] {
        let client = Arc::new(Client::new(
            id,
            format!("Client {id}"),
            ClientSettings::default(),
            recording_hooks(&recorder, id),
            ctx.clone(),
        ));
        client.connect_to(Link::to(proxy.clone(), client_params, ctx.clone()));
        proxy.connect_to(id, Link::to(client.clone(), client_params, ctx.clone()));
        clients.push(client);
    }

    let server = Arc::new(VideoServer::new(1, "s1"));
    server.add_video(video("v", 2048.0));
    server.connect_to(Link::to(proxy.clone(), server_params, ctx.clone()));
    proxy.connect_to(1, Link::to(server.clone(), server_params, ctx.clone()));

    clients[0].request_media("v", 1);
    ctx.clock.sleep(3.0).await;
    clients[1].request_media("v", 1);

    let latency_b = wait_for(|| recorder.latencies_for(1002).first().copied()).await;
    let latency_a = recorder.latencies_for(1001)[0];
    assert!(
        latency_b < latency_a,
        "cache hit ({latency_b}) should beat origin fetch ({latency_a})"
    );

    let stats = proxy.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.nb_served, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lru_promotion_through_pipeline() {
    // Room for three videos. Request v1 v2 v3 v1 v4: the v1 hit promotes
    // it, so v2 is the coldest entry when v4 needs space.
    let ctx = Arc::new(SimContext::new(20.0, 1.0));
    let proxy = Arc::new(Proxy::new(0, "Proxy", ProxyKind::Lru, 3500.0));

    let params = LinkParams {
        latency_s: 0.05,
        bandwidth_kb_s: 50_000.0,
        max_chunk_kb: 16000.0,
    };

    let client = Arc::new(Client::new(
        1001,
        "c1",
        ClientSettings::default(),
        gauge_hooks(&ctx, ClientHooks::new()),
        ctx.clone(),
    ));
    client.connect_to(Link::to(proxy.clone(), params, ctx.clone()));
    proxy.connect_to(1001, Link::to(client.clone(), params, ctx.clone()));

    let server = Arc::new(VideoServer::new(1, "s1"));
    for id in ["v1", "v2", "v3", "v4"] {
        server.add_video(video(id, 1024.0));
    }
    server.connect_to(Link::to(proxy.clone(), params, ctx.clone()));
    proxy.connect_to(1, Link::to(server.clone(), params, ctx.clone()));

    for id in ["v1", "v2", "v3", "v1", "v4"] {
        client.request_media(id, 1);
        ctx.downloads.wait_idle().await;
    }

    assert!(proxy.cache_contains(&"v1".to_string()));
    assert!(proxy.cache_contains(&"v3".to_string()));
    assert!(proxy.cache_contains(&"v4".to_string()));
    assert!(!proxy.cache_contains(&"v2".to_string()));
    assert_eq!(proxy.pending_requests(), 0);
}

/// Plain peer that records the arrival time of everything it receives.
struct TimedPeer {
    core: PeerCore,
    ctx: Arc<SimContext>,
    received: Mutex<Vec<(f64, Packet)>>,
}

impl TimedPeer {
    fn new(id: PeerId, ctx: Arc<SimContext>) -> Self {
        TimedPeer {
            core: PeerCore::new(id, format!("peer {id}")),
            ctx,
            received: Mutex::new(Vec::new()),
        }
    }
}

impl Peer for TimedPeer {
    fn id(&self) -> PeerId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn received(&self, packet: Packet) {
        let now = self.ctx.clock.now();
        self.received.lock().unwrap().push((now, packet));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_back_to_back_requests_serialize_on_the_link() {
    // Latency 1s each way, huge bandwidth. The second request waits for
    // the first to clear the uplink, so its echo lands one second later.
    let ctx = Arc::new(SimContext::new(6.0, 1.0));
    let proxy = Arc::new(Proxy::forward(0, "Proxy"));
    let peer = Arc::new(TimedPeer::new(1001, ctx.clone()));

    let params = LinkParams {
        latency_s: 1.0,
        bandwidth_kb_s: 100_000.0,
        max_chunk_kb: 512.0,
    };
    peer.core.connect_to(Link::to(proxy.clone(), params, ctx.clone()));
    proxy.connect_to(1001, Link::to(peer.clone(), params, ctx.clone()));

    let start = ctx.clock.now();
    peer.core.request("lol");
    peer.core.request("pouet");

    wait_for(|| (peer.received.lock().unwrap().len() >= 2).then_some(())).await;

    let received = peer.received.lock().unwrap();
    let first = received[0].0 - start;
    let second = received[1].0 - start;
    assert!(first > 2.0 && first < 3.0, "first echo at {first}");
    assert!(second > 3.0 && second < 4.0, "second echo at {second}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unlimited_cache_hits_equal_repeats() {
    // With an unlimited cache, hits = requests - distinct videos.
    let ctx = Arc::new(SimContext::new(20.0, 1.0));
    let proxy = Arc::new(Proxy::new(0, "Proxy", ProxyKind::Unlimited, 0.0));

    let params = LinkParams {
        latency_s: 0.05,
        bandwidth_kb_s: 50_000.0,
        max_chunk_kb: 16000.0,
    };
    let client = Arc::new(Client::new(
        1001,
        "c1",
        ClientSettings::default(),
        gauge_hooks(&ctx, ClientHooks::new()),
        ctx.clone(),
    ));
    client.connect_to(Link::to(proxy.clone(), params, ctx.clone()));
    proxy.connect_to(1001, Link::to(client.clone(), params, ctx.clone()));

    let server = Arc::new(VideoServer::new(1, "s1"));
    for id in ["v1", "v2", "v3"] {
        server.add_video(video(id, 512.0));
    }
    server.connect_to(Link::to(proxy.clone(), params, ctx.clone()));
    proxy.connect_to(1, Link::to(server.clone(), params, ctx.clone()));

    let sequence = ["v1", "v2", "v1", "v3", "v2", "v1"];
    for id in sequence {
        client.request_media(id, 1);
        ctx.downloads.wait_idle().await;
    }

    let stats = proxy.stats();
    assert_eq!(stats.nb_served as usize, sequence.len());
    assert_eq!(stats.cache_hits as usize, sequence.len() - 3);
    assert_eq!(proxy.pending_requests(), 0);
}
