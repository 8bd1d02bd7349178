use mqtt_to_influx::config::MqttConfig;
use mqtt_to_influx::mqtt::Subscription;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const CONNECT: u8 = 0x10;
const SUBSCRIBE: u8 = 0x82;
const DISCONNECT: u8 = 0xE0;
const CONNACK: [u8; 5] = [0x20, 0x03, 0x00, 0x00, 0x00];
/// QoS 0 PUBLISH to "t" with payload "x".
const PUBLISH_X: [u8; 7] = [0x30, 0x05, 0x00, 0x01, b't', 0x00, b'x'];

fn mqtt_cfg(port: u16) -> MqttConfig {
    MqttConfig {
        host: "127.0.0.1".into(),
        port,
        client_id: "mqtt-to-influx-test".into(),
        username: None,
        password: None,
        keep_alive_secs: Some(30),
        clean_session: Some(true),
        topic: "sensors/env".into(),
        qos: 1,
        tls: None,
    }
}

/// Read one control packet: its first header byte and the variable part.
async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let header = stream.read_u8().await.unwrap();
    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let b = stream.read_u8().await.unwrap();
        len |= ((b & 0x7f) as usize) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; len];
    stream.read_exact(&mut body).await.unwrap();
    (header, body)
}

/// Accept a client and answer its CONNECT.
async fn accept(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let (header, _) = read_packet(&mut stream).await;
    assert_eq!(header, CONNECT);
    stream.write_all(&CONNACK).await.unwrap();
    stream
}

/// Wait for a SUBSCRIBE and grant it.
async fn grant_subscribe(stream: &mut TcpStream) {
    let (header, body) = read_packet(stream).await;
    assert_eq!(header, SUBSCRIBE);
    // packet id, no properties, QoS 1 granted
    stream
        .write_all(&[0x90, 0x04, body[0], body[1], 0x00, 0x01])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_subscribes_again_after_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut subscription = Subscription::open(&mqtt_cfg(port)).unwrap();
    let client = tokio::spawn(async move {
        loop {
            match subscription.next_publish().await {
                Ok(msg) => {
                    let _ = seen_tx.send(msg.payload);
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    });

    let broker = async {
        let mut first = accept(&listener).await;
        grant_subscribe(&mut first).await;
        first.write_all(&PUBLISH_X).await.unwrap();
        // Once the publish is through, the SUBACK before it has been handled too.
        seen_rx.recv().await.unwrap();
        drop(first);

        let mut second = accept(&listener).await;
        grant_subscribe(&mut second).await;
    };
    timeout(Duration::from_secs(5), broker)
        .await
        .expect("client did not subscribe on the new connection");
    client.abort();
}

#[tokio::test]
async fn test_disconnect_reaches_broker() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut subscription = Subscription::open(&mqtt_cfg(port)).unwrap();
    let client = tokio::spawn(async move {
        let msg = subscription.next_publish().await.unwrap();
        assert_eq!(msg.payload.as_ref(), b"x");
        // The broker may close first; only what it received matters.
        let _ = subscription.disconnect(Duration::from_secs(2)).await;
    });

    let broker = async {
        let mut stream = accept(&listener).await;
        grant_subscribe(&mut stream).await;
        stream.write_all(&PUBLISH_X).await.unwrap();
        let (header, _) = read_packet(&mut stream).await;
        header
    };
    let header = timeout(Duration::from_secs(5), broker)
        .await
        .expect("broker never saw the client hang up");
    assert_eq!(header, DISCONNECT);
    client.await.unwrap();
}
