//! In-process integration tests for the resolver pipeline and listeners.
//!
//! These tests run the real resolver against stub upstream servers on
//! loopback sockets, covering caching, coalescing, policy evaluation,
//! truncation fallback, and total upstream failure.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, SOA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

use sift_dns::{Config, DnsServer, Resolver};

fn build_query(name: &str, rtype: RecordType, id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), rtype));
    msg
}

fn reply_shell(query: &Message) -> Message {
    let mut msg = Message::new();
    msg.set_id(query.id());
    msg.set_message_type(MessageType::Response);
    msg.set_response_code(ResponseCode::NoError);
    for q in query.queries() {
        msg.add_query(q.clone());
    }
    msg
}

fn answer_with(query: &Message, ips: &[Ipv4Addr], ttl: u32) -> Message {
    let mut msg = reply_shell(query);
    let name = query.queries()[0].name().clone();
    for ip in ips {
        msg.add_answer(Record::from_rdata(name.clone(), ttl, RData::A(A(*ip))));
    }
    msg
}

fn nxdomain_with_soa(query: &Message, minimum: u32) -> Message {
    let mut msg = reply_shell(query);
    msg.set_response_code(ResponseCode::NXDomain);
    let soa = SOA::new(
        Name::from_str("ns1.example.").unwrap(),
        Name::from_str("hostmaster.example.").unwrap(),
        1,
        7200,
        900,
        86400,
        minimum,
    );
    msg.add_name_server(Record::from_rdata(
        Name::from_str("example.").unwrap(),
        3600,
        RData::SOA(soa),
    ));
    msg
}

/// Stub upstream on a loopback UDP socket. The handler decides the reply;
/// `None` means stay silent. Every received query bumps the counter.
async fn spawn_udp_stub<F>(delay: Duration, handler: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(&Message) -> Option<Message> + Send + Sync + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            seen.fetch_add(1, Ordering::SeqCst);
            let Ok(query) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            if let Some(reply) = handler(&query) {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let _ = socket.send_to(&reply.to_vec().unwrap(), peer).await;
            }
        }
    });
    (addr, counter)
}

fn config_for(listen: &str, upstreams: &[SocketAddr], extra: &str) -> Config {
    let list = upstreams
        .iter()
        .map(|addr| format!("\"{}\"", addr))
        .collect::<Vec<_>>()
        .join(", ");
    let toml = format!(
        "listen = \"{}\"\nnameservers = [{}]\n{}",
        listen, list, extra
    );
    Config::from_toml(&toml).unwrap()
}

async fn build_resolver(config: &Config) -> (Arc<Resolver>, broadcast::Sender<()>) {
    let (shutdown, _) = broadcast::channel(1);
    let resolver = Resolver::new(config, &shutdown).await.unwrap();
    (Arc::new(resolver), shutdown)
}

async fn resolve_one(resolver: &Resolver, query: &Message, client: &str) -> Option<Message> {
    let wire = query.to_vec().unwrap();
    let reply = resolver.resolve(&wire, Some(client.parse().unwrap())).await?;
    Some(Message::from_vec(&reply).unwrap())
}

fn answer_ips(reply: &Message) -> Vec<Ipv4Addr> {
    reply
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::A(a) => Some(a.0),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_scenario_positive_cache() {
    let (upstream, counter) = spawn_udp_stub(Duration::ZERO, |query| {
        Some(answer_with(query, &[Ipv4Addr::new(1, 2, 3, 4)], 300))
    })
    .await;
    let config = config_for(
        "127.0.0.1:0",
        &[upstream],
        "positive_ttl = 60\nnegative_ttl = 300\n",
    );
    let (resolver, _shutdown) = build_resolver(&config).await;

    let first = resolve_one(&resolver, &build_query("a.example.", RecordType::A, 1), "10.0.0.1")
        .await
        .expect("first reply");
    assert_eq!(first.id(), 1);
    assert_eq!(answer_ips(&first), vec![Ipv4Addr::new(1, 2, 3, 4)]);

    let second = resolve_one(&resolver, &build_query("a.example.", RecordType::A, 2), "10.0.0.1")
        .await
        .expect("second reply");
    assert_eq!(second.id(), 2);
    assert_eq!(answer_ips(&second), vec![Ipv4Addr::new(1, 2, 3, 4)]);

    assert_eq!(counter.load(Ordering::SeqCst), 1, "second query must be served from cache");
}

#[tokio::test]
async fn test_scenario_negative_cache_honours_soa_minimum() {
    let (upstream, counter) =
        spawn_udp_stub(Duration::ZERO, |query| Some(nxdomain_with_soa(query, 120))).await;
    let config = config_for("127.0.0.1:0", &[upstream], "negative_ttl = 300\n");
    let (resolver, _shutdown) = build_resolver(&config).await;

    let query = build_query("gone.example.", RecordType::A, 1);
    let first = resolve_one(&resolver, &query, "10.0.0.1").await.expect("reply");
    assert_eq!(first.response_code(), ResponseCode::NXDomain);

    let remaining = resolver.cache().remaining_ttl(&query).await.expect("cached entry");
    assert!(remaining <= Duration::from_secs(120));

    let second = resolve_one(&resolver, &build_query("gone.example.", RecordType::A, 2), "10.0.0.1")
        .await
        .expect("reply");
    assert_eq!(second.response_code(), ResponseCode::NXDomain);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scenario_override_by_subnet() {
    let (upstream, counter) = spawn_udp_stub(Duration::ZERO, |query| {
        Some(answer_with(query, &[Ipv4Addr::new(5, 6, 7, 8)], 300))
    })
    .await;
    let config = config_for(
        "127.0.0.1:0",
        &[upstream],
        r#"positive_ttl = 60
[overrides]
"svc.local" = { ips = ["127.0.0.1"], subnets = ["192.168.0.0/16"] }
"#,
    );
    let (resolver, _shutdown) = build_resolver(&config).await;

    let inside = resolve_one(&resolver, &build_query("svc.local.", RecordType::A, 1), "192.168.1.5")
        .await
        .expect("override reply");
    assert!(inside.authoritative());
    assert_eq!(answer_ips(&inside), vec![Ipv4Addr::new(127, 0, 0, 1)]);
    assert_eq!(inside.answers()[0].ttl(), 300);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    let outside = resolve_one(&resolver, &build_query("svc.local.", RecordType::A, 2), "10.0.0.5")
        .await
        .expect("forwarded reply");
    assert_eq!(answer_ips(&outside), vec![Ipv4Addr::new(5, 6, 7, 8)]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scenario_coalescing_single_upstream_call() {
    let (upstream, counter) = spawn_udp_stub(Duration::from_millis(200), |query| {
        Some(answer_with(query, &[Ipv4Addr::new(4, 4, 4, 4)], 300))
    })
    .await;
    let config = config_for("127.0.0.1:0", &[upstream], "positive_ttl = 60\n");
    let (resolver, _shutdown) = build_resolver(&config).await;

    let mut tasks = Vec::new();
    for id in 0..50u16 {
        let resolver = resolver.clone();
        tasks.push(tokio::spawn(async move {
            let query = build_query("slow.example.", RecordType::A, id);
            let reply = resolve_one(&resolver, &query, "10.0.0.1").await.expect("reply");
            (id, reply)
        }));
    }

    for task in tasks {
        let (id, reply) = task.await.unwrap();
        assert_eq!(reply.id(), id, "each responder keeps its own transaction ID");
        assert_eq!(reply.queries(), build_query("slow.example.", RecordType::A, id).queries());
        assert_eq!(answer_ips(&reply), vec![Ipv4Addr::new(4, 4, 4, 4)]);
    }

    assert_eq!(counter.load(Ordering::SeqCst), 1, "one upstream exchange for 50 clients");
}

#[tokio::test]
async fn test_scenario_truncation_falls_back_to_tcp() {
    // UDP side answers truncated and empty; TCP on the same port carries
    // the full ten-record answer.
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = udp.local_addr().unwrap();
    let udp_counter = Arc::new(AtomicUsize::new(0));
    let udp_seen = udp_counter.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, peer)) = udp.recv_from(&mut buf).await else {
                break;
            };
            udp_seen.fetch_add(1, Ordering::SeqCst);
            let Ok(query) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            let mut reply = reply_shell(&query);
            reply.set_truncated(true);
            let _ = udp.send_to(&reply.to_vec().unwrap(), peer).await;
        }
    });

    let tcp = TcpListener::bind(("127.0.0.1", addr.port())).await.unwrap();
    let tcp_counter = Arc::new(AtomicUsize::new(0));
    let tcp_seen = tcp_counter.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = tcp.accept().await else {
                break;
            };
            tcp_seen.fetch_add(1, Ordering::SeqCst);
            let mut len_buf = [0u8; 2];
            if stream.read_exact(&mut len_buf).await.is_err() {
                continue;
            }
            let mut qbuf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            if stream.read_exact(&mut qbuf).await.is_err() {
                continue;
            }
            let query = Message::from_vec(&qbuf).unwrap();
            let ips: Vec<Ipv4Addr> = (1..=10).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();
            let reply = answer_with(&query, &ips, 300);
            let wire = reply.to_vec().unwrap();
            let mut framed = Vec::with_capacity(2 + wire.len());
            framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
            framed.extend_from_slice(&wire);
            let _ = stream.write_all(&framed).await;
        }
    });

    let config = config_for("127.0.0.1:0", &[addr], "positive_ttl = 60\n");
    let (resolver, _shutdown) = build_resolver(&config).await;

    let reply = resolve_one(&resolver, &build_query("big.example.", RecordType::A, 1), "10.0.0.1")
        .await
        .expect("reply");
    assert!(!reply.truncated());
    assert_eq!(reply.answers().len(), 10);
    assert_eq!(udp_counter.load(Ordering::SeqCst), 1);
    assert_eq!(tcp_counter.load(Ordering::SeqCst), 1);

    // The de-truncated form is what got cached.
    let second = resolve_one(&resolver, &build_query("big.example.", RecordType::A, 2), "10.0.0.1")
        .await
        .expect("cached reply");
    assert!(!second.truncated());
    assert_eq!(second.answers().len(), 10);
    assert_eq!(udp_counter.load(Ordering::SeqCst), 1);
    assert_eq!(tcp_counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scenario_total_upstream_failure() {
    let (first, first_counter) = spawn_udp_stub(Duration::ZERO, |_| None).await;
    let (second, second_counter) = spawn_udp_stub(Duration::ZERO, |_| None).await;
    let config = config_for(
        "127.0.0.1:0",
        &[first, second],
        "positive_ttl = 60\nnegative_ttl = 300\n",
    );
    let (resolver, _shutdown) = build_resolver(&config).await;

    let reply = resolve_one(&resolver, &build_query("dead.example.", RecordType::A, 1), "10.0.0.1")
        .await
        .expect("synthesized reply");
    assert_eq!(reply.response_code(), ResponseCode::NXDomain);
    assert!(reply.authoritative());
    assert_eq!(first_counter.load(Ordering::SeqCst), 1);
    assert_eq!(second_counter.load(Ordering::SeqCst), 1);

    // Cached under the negative policy: no further upstream attempts.
    let cached = resolve_one(&resolver, &build_query("dead.example.", RecordType::A, 2), "10.0.0.1")
        .await
        .expect("cached reply");
    assert_eq!(cached.response_code(), ResponseCode::NXDomain);
    assert_eq!(first_counter.load(Ordering::SeqCst), 1);
    assert_eq!(second_counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_blocked_domain_from_list_file() {
    let path = std::env::temp_dir().join("sift-resolver-blocklist-test.txt");
    tokio::fs::write(&path, "ads.example.com\n").await.unwrap();

    let (upstream, counter) = spawn_udp_stub(Duration::ZERO, |query| {
        Some(answer_with(query, &[Ipv4Addr::new(5, 6, 7, 8)], 300))
    })
    .await;
    let config = config_for(
        "127.0.0.1:0",
        &[upstream],
        &format!("block_lists = [\"{}\"]\n", path.display()),
    );
    let (resolver, _shutdown) = build_resolver(&config).await;

    let blocked = resolve_one(
        &resolver,
        &build_query("ads.example.com.", RecordType::A, 1),
        "10.0.0.1",
    )
    .await
    .expect("blocked reply");
    assert_eq!(blocked.response_code(), ResponseCode::NXDomain);
    assert!(blocked.authoritative());

    let sub = resolve_one(
        &resolver,
        &build_query("banner.ads.example.com.", RecordType::A, 2),
        "10.0.0.1",
    )
    .await
    .expect("blocked subdomain reply");
    assert_eq!(sub.response_code(), ResponseCode::NXDomain);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    let allowed = resolve_one(
        &resolver,
        &build_query("news.example.com.", RecordType::A, 3),
        "10.0.0.1",
    )
    .await
    .expect("forwarded reply");
    assert_eq!(answer_ips(&allowed), vec![Ipv4Addr::new(5, 6, 7, 8)]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let _ = tokio::fs::remove_file(&path).await;
}

#[tokio::test]
async fn test_no_upstreams_answers_servfail() {
    let config = config_for("127.0.0.1:0", &[], "");
    let (resolver, _shutdown) = build_resolver(&config).await;

    let reply = resolve_one(&resolver, &build_query("a.example.", RecordType::A, 5), "10.0.0.1")
        .await
        .expect("reply");
    assert_eq!(reply.id(), 5);
    assert_eq!(reply.response_code(), ResponseCode::ServFail);
}

#[tokio::test]
async fn test_malformed_queries_are_dropped() {
    let (upstream, counter) = spawn_udp_stub(Duration::ZERO, |query| {
        Some(answer_with(query, &[Ipv4Addr::new(5, 6, 7, 8)], 300))
    })
    .await;
    let config = config_for("127.0.0.1:0", &[upstream], "");
    let (resolver, _shutdown) = build_resolver(&config).await;

    assert!(resolver.resolve(&[0xde, 0xad], None).await.is_none());

    let mut no_question = Message::new();
    no_question.set_id(9);
    assert!(resolver
        .resolve(&no_question.to_vec().unwrap(), None)
        .await
        .is_none());
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

async fn available_port() -> u16 {
    loop {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = udp.local_addr().unwrap().port();
        if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            return port;
        }
    }
}

#[tokio::test]
async fn test_listeners_end_to_end() {
    let (upstream, _counter) = spawn_udp_stub(Duration::ZERO, |query| {
        Some(answer_with(query, &[Ipv4Addr::new(9, 9, 9, 9)], 300))
    })
    .await;

    let port = available_port().await;
    let listen = format!("127.0.0.1:{}", port);
    let config = config_for(&listen, &[upstream], "positive_ttl = 60\n");
    let (resolver, shutdown) = build_resolver(&config).await;

    let server = DnsServer::new(config.listen, resolver, shutdown.clone());
    tokio::spawn(server.run());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let listen_addr: SocketAddr = listen.parse().unwrap();

    // UDP round trip.
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let query = build_query("udp.example.", RecordType::A, 321);
    client
        .send_to(&query.to_vec().unwrap(), listen_addr)
        .await
        .unwrap();
    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("UDP reply in time")
        .unwrap();
    let reply = Message::from_vec(&buf[..len]).unwrap();
    assert_eq!(reply.id(), 321);
    assert_eq!(answer_ips(&reply), vec![Ipv4Addr::new(9, 9, 9, 9)]);

    // TCP round trip on the same address.
    let mut stream = TcpStream::connect(listen_addr).await.unwrap();
    let query = build_query("tcp.example.", RecordType::A, 654);
    let wire = query.to_vec().unwrap();
    let mut framed = Vec::with_capacity(2 + wire.len());
    framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
    framed.extend_from_slice(&wire);
    stream.write_all(&framed).await.unwrap();

    let mut len_buf = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut len_buf))
        .await
        .expect("TCP reply in time")
        .unwrap();
    let mut reply_buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut reply_buf).await.unwrap();
    let reply = Message::from_vec(&reply_buf).unwrap();
    assert_eq!(reply.id(), 654);
    assert_eq!(answer_ips(&reply), vec![Ipv4Addr::new(9, 9, 9, 9)]);

    let _ = shutdown.send(());
}
