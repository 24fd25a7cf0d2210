use swarm_rs::torrent::InfoHash;
use swarm_rs::tracker::{TrackerClient, TrackerError};

fn client_for(server: &mockito::ServerGuard) -> TrackerClient {
    TrackerClient::new(
        format!("{}/announce", server.url()),
        // ASCII bytes keep the percent-encoded query valid UTF-8 for the
        // mock server's matcher.
        InfoHash::new([0x41; 20]),
        "-SW0001-TESTTESTTEST".to_string(),
        6881,
    )
}

#[tokio::test]
async fn announce_decodes_interval_and_compact_peers() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/announce")
        .match_query(mockito::Matcher::Any)
        .with_body(&b"d8:intervali1800e12:min intervali900e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x1a\xe2e"[..])
        .create_async()
        .await;

    let response = client_for(&server).announce(0, 0, 1000).await.unwrap();

    assert_eq!(response.interval, 1800);
    assert_eq!(response.min_interval, Some(900));
    assert_eq!(
        response.peers.0,
        vec![
            "127.0.0.1:6881".parse().unwrap(),
            "10.0.0.2:6882".parse().unwrap(),
        ]
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn announce_surfaces_tracker_refusal() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/announce")
        .match_query(mockito::Matcher::Any)
        .with_body(&b"d14:failure reason15:unknown torrente"[..])
        .create_async()
        .await;

    let error = client_for(&server).announce(0, 0, 1000).await.unwrap_err();
    match error {
        TrackerError::Refused(reason) => assert_eq!(reason, "unknown torrent"),
        other => panic!("expected a refusal, got {:?}", other),
    }
}

#[tokio::test]
async fn announce_query_carries_stats_and_info_hash() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/announce")
        .match_query(mockito::Matcher::AllOf(vec![
            mockito::Matcher::UrlEncoded("uploaded".into(), "10".into()),
            mockito::Matcher::UrlEncoded("downloaded".into(), "20".into()),
            mockito::Matcher::UrlEncoded("left".into(), "30".into()),
            mockito::Matcher::UrlEncoded("compact".into(), "1".into()),
            mockito::Matcher::UrlEncoded("port".into(), "6881".into()),
        ]))
        .with_body(&b"d8:intervali60e5:peers0:e"[..])
        .create_async()
        .await;

    let response = client_for(&server).announce(10, 20, 30).await.unwrap();
    assert!(response.peers.0.is_empty());
    mock.assert_async().await;
}

#[tokio::test]
async fn undecodable_body_is_an_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/announce")
        .match_query(mockito::Matcher::Any)
        .with_body("not bencode at all")
        .create_async()
        .await;

    let error = client_for(&server).announce(0, 0, 0).await.unwrap_err();
    assert!(matches!(error, TrackerError::Decode(_)));
}
