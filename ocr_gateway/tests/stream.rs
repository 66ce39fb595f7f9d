mod common;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use common::{config, decode_data_uri_png, solid_png, spawn_server, state, PacedDetector};
use futures::{SinkExt, StreamExt};
use ocr_gateway::detector::StaticDetector;
use serde_json::Value;
use std::{net::SocketAddr, time::Duration};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(addr: SocketAddr, client_id: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{}/ocr_ws/{}", addr, client_id))
        .await
        .unwrap();
    ws
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .unwrap();

        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send_png(ws: &mut Client, color: [u8; 3]) {
    ws.send(Message::Binary(solid_png(4, 4, color).into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_results_arrive_in_submission_order() {
    let mut config = config();
    config.queue.pipeline_depth = 4;
    let detector = PacedDetector {
        // Later frames finish first.
        delay_ms: |tag| 50 * (5 - tag as u64),
        ..PacedDetector::instant()
    };
    let addr = spawn_server(&config, state(&config, detector)).await;
    let mut ws = connect(addr, "alice").await;

    for tag in 0..5u8 {
        send_png(&mut ws, [tag, 0, 0]).await;
    }

    for tag in 0..5u8 {
        let result = next_json(&mut ws).await;
        assert_eq!(result["sequence"], tag as u64);
        assert_eq!(result["prediction"], Value::Array(Vec::new()));

        let preview = decode_data_uri_png(result["output"].as_str().unwrap());
        assert_eq!(preview.get_pixel(0, 0)[0], tag);
    }
}

#[tokio::test]
async fn test_text_data_uri_without_padding_is_accepted() {
    let config = config();
    let addr = spawn_server(&config, state(&config, StaticDetector::empty())).await;
    let mut ws = connect(addr, "alice").await;

    let png = solid_png(10, 10, [255, 0, 0]);
    let payload = format!("data:image/png;base64,{}", STANDARD_NO_PAD.encode(&png));
    ws.send(Message::Text(payload.into())).await.unwrap();

    let result = next_json(&mut ws).await;
    let preview = decode_data_uri_png(result["output"].as_str().unwrap());
    assert_eq!(preview.dimensions(), (10, 10));
    assert_eq!(preview.get_pixel(9, 9), &image::Rgb([255, 0, 0]));
}

#[tokio::test]
async fn test_decode_error_is_reported_and_connection_stays_open() {
    let config = config();
    let addr = spawn_server(&config, state(&config, StaticDetector::empty())).await;
    let mut ws = connect(addr, "alice").await;

    ws.send(Message::Text("data:image/png;base64,!!!".into()))
        .await
        .unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error["event"], "error");
    assert_eq!(error["kind"], "decode");

    send_png(&mut ws, [1, 2, 3]).await;
    let result = next_json(&mut ws).await;
    assert_eq!(result["sequence"], 0);
}

#[tokio::test]
async fn test_overflow_reports_backpressure() {
    let mut config = config();
    config.queue.session_capacity = 1;
    config.queue.pipeline_depth = 1;
    let detector = PacedDetector {
        delay_ms: |_| 300,
        ..PacedDetector::instant()
    };
    let addr = spawn_server(&config, state(&config, detector)).await;
    let mut ws = connect(addr, "alice").await;

    for tag in 0..3u8 {
        send_png(&mut ws, [tag, 0, 0]).await;
    }

    let mut results = Vec::new();
    let mut rejected = 0;
    for _ in 0..3 {
        let message = next_json(&mut ws).await;
        if message["event"] == "error" {
            assert_eq!(message["kind"], "backpressure");
            rejected += 1;
        } else {
            results.push(message);
        }
    }

    assert_eq!(rejected, 2);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["sequence"], 0);
}

#[tokio::test]
async fn test_join_and_leave_are_broadcast() {
    let config = config();
    let addr = spawn_server(&config, state(&config, StaticDetector::empty())).await;
    let mut alice = connect(addr, "alice").await;

    // A result proves alice's session is open before bob arrives.
    send_png(&mut alice, [3, 3, 3]).await;
    assert_eq!(next_json(&mut alice).await["sequence"], 0);

    let mut bob = connect(addr, "bob").await;

    let joined = next_json(&mut alice).await;
    assert_eq!(joined["event"], "joined");
    assert_eq!(joined["client_id"], "bob");

    send_png(&mut bob, [5, 5, 5]).await;
    bob.close(None).await.unwrap();

    let left = next_json(&mut alice).await;
    assert_eq!(left["event"], "left");
    assert_eq!(left["client_id"], "bob");

    send_png(&mut alice, [7, 7, 7]).await;
    let result = next_json(&mut alice).await;
    assert_eq!(result["sequence"], 1);
}

#[tokio::test]
async fn test_duplicate_client_id_is_refused() {
    let config = config();
    let addr = spawn_server(&config, state(&config, StaticDetector::empty())).await;
    let _alice = connect(addr, "alice").await;

    let err = connect_async(format!("ws://{}/ocr_ws/alice", addr))
        .await
        .unwrap_err();

    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 409);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_generated_id_and_server_shutdown() {
    let config = config();
    let state = state(&config, StaticDetector::empty());
    let sessions = state.sessions.clone();
    let addr = spawn_server(&config, state).await;

    let (mut ws, _) = connect_async(format!("ws://{}/ocr_ws", addr)).await.unwrap();
    send_png(&mut ws, [1, 1, 1]).await;
    let result = next_json(&mut ws).await;
    assert_eq!(result["sequence"], 0);
    assert_eq!(sessions.len(), 1);

    sessions.shutdown();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(message) = ws.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    tokio::time::timeout(Duration::from_secs(5), async {
        while !sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session was not removed");
}

async fn wait_until_no_sessions(sessions: &ocr_gateway::session::SessionManager) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !sessions.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sessions were not removed");
}

/// Incompressible image so results stay large once encoded.
fn noisy_png(size: u32, tag: u8) -> Vec<u8> {
    let mut seed: u32 = 0x9e37_79b9 ^ tag as u32;
    let mut image = image::RgbImage::from_fn(size, size, |_, _| {
        seed ^= seed << 13;
        seed ^= seed >> 17;
        seed ^= seed << 5;
        let [r, g, b, _] = seed.to_le_bytes();
        image::Rgb([r, g, b])
    });
    image.put_pixel(0, 0, image::Rgb([tag, 0, 0]));

    let mut buffer = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, image::ImageFormat::Png)
        .unwrap();
    buffer.into_inner()
}

#[tokio::test]
async fn test_reconnect_does_not_receive_results_of_previous_connection() {
    let config = config();
    let detector = PacedDetector {
        delay_ms: |_| 400,
        ..PacedDetector::instant()
    };
    let state = state(&config, detector);
    let sessions = state.sessions.clone();
    let addr = spawn_server(&config, state).await;

    let mut first = connect(addr, "alice").await;
    send_png(&mut first, [9, 0, 0]).await;
    first.close(None).await.unwrap();
    wait_until_no_sessions(&sessions).await;

    let mut second = connect(addr, "alice").await;

    // The first connection's frame finishes in this window.
    let early = tokio::time::timeout(Duration::from_millis(800), second.next()).await;
    assert!(early.is_err(), "unexpected message: {:?}", early);

    send_png(&mut second, [1, 0, 0]).await;
    let result = next_json(&mut second).await;
    assert_eq!(result["sequence"], 0);
    let preview = decode_data_uri_png(result["output"].as_str().unwrap());
    assert_eq!(preview.get_pixel(0, 0)[0], 1);
}

#[tokio::test]
async fn test_disconnect_with_frames_in_flight() {
    let config = config();
    let detector = PacedDetector {
        delay_ms: |_| 300,
        ..PacedDetector::instant()
    };
    let state = state(&config, detector);
    let sessions = state.sessions.clone();
    let addr = spawn_server(&config, state).await;

    let mut alice = connect(addr, "alice").await;
    send_png(&mut alice, [1, 0, 0]).await;
    assert_eq!(next_json(&mut alice).await["sequence"], 0);

    let mut bob = connect(addr, "bob").await;
    let joined = next_json(&mut alice).await;
    assert_eq!(joined["event"], "joined");
    assert_eq!(joined["client_id"], "bob");

    send_png(&mut bob, [20, 0, 0]).await;
    send_png(&mut bob, [21, 0, 0]).await;
    send_png(&mut alice, [2, 0, 0]).await;
    send_png(&mut alice, [3, 0, 0]).await;
    bob.close(None).await.unwrap();

    let mut left = 0;
    let mut results = Vec::new();
    while left == 0 || results.len() < 2 {
        let message = next_json(&mut alice).await;
        if message["event"] == "left" {
            assert_eq!(message["client_id"], "bob");
            left += 1;
        } else {
            assert!(message.get("event").is_none(), "unexpected event: {message}");
            results.push(message);
        }
    }

    for (result, tag) in results.iter().zip([2u8, 3]) {
        assert_eq!(result["sequence"], (tag - 1) as u64);
        let preview = decode_data_uri_png(result["output"].as_str().unwrap());
        assert_eq!(preview.get_pixel(0, 0)[0], tag);
    }

    // Bob's frames have finished by now and went nowhere.
    let late = tokio::time::timeout(Duration::from_millis(500), alice.next()).await;
    assert!(late.is_err(), "unexpected message: {:?}", late);

    while let Some(message) = bob.next().await {
        match message {
            Ok(Message::Text(text)) => panic!("closed connection got a result: {text}"),
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert_eq!(sessions.len(), 1);
}

#[tokio::test]
async fn test_shutdown_closes_session_that_stopped_reading() {
    let mut config = config();
    config.session.outbound_capacity = 1;
    config.session.close_grace_ms = 200;
    let state = state(&config, PacedDetector::instant());
    let sessions = state.sessions.clone();
    let addr = spawn_server(&config, state).await;

    // Never read from this client, so the socket and the outbound queue fill up.
    let mut ws = connect(addr, "alice").await;
    for tag in 0..6u8 {
        ws.send(Message::Binary(noisy_png(512, tag).into()))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(sessions.len(), 1);

    sessions.shutdown();
    wait_until_no_sessions(&sessions).await;
}
