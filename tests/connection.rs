use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Encoder;
use wscore::{
    codec::FrameEncoder, CloseCode, Event, Frame, FrameReceiveMode, Masking, Message, OpCode,
    Options, Payload, Role, WebSocket, WebSocketError,
};

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

fn server(mode: FrameReceiveMode) -> (WebSocket<DuplexStream>, DuplexStream) {
    server_with(Options::default().with_frame_receive_mode(mode))
}

fn server_with(options: Options) -> (WebSocket<DuplexStream>, DuplexStream) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    (
        WebSocket::from_stream(local, Role::Server, Bytes::new(), options),
        remote,
    )
}

/// Encodes frames the way a client would send them.
fn client_bytes(frames: impl IntoIterator<Item = Frame>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for frame in frames {
        FrameEncoder
            .encode(frame.with_mask(MASK), &mut buf)
            .unwrap();
    }
    buf.to_vec()
}

async fn next_message<S: wscore::Transport>(ws: &mut WebSocket<S>) -> Message {
    loop {
        match ws.next().await {
            Some(Event::Message(message)) => return message,
            Some(Event::Drain) => continue,
            other => panic!("expected a message, got {other:?}"),
        }
    }
}

/// Polls `ws` until it closes and returns every event seen.
async fn drain_events<S: wscore::Transport>(ws: &mut WebSocket<S>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = ws.next().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn unmasked_text_frame_bytes() -> anyhow::Result<()> {
    let (mut ws, mut remote) = server(FrameReceiveMode::Standard);

    ws.write_text("hello")?;
    ws.flush().await?;

    let mut buf = [0u8; 7];
    remote.read_exact(&mut buf).await?;
    assert_eq!(buf, [0x81, 0x05, b'h', b'e', b'l', b'l', b'o']);
    Ok(())
}

#[tokio::test]
async fn client_masks_with_fixed_key() -> anyhow::Result<()> {
    let (local, mut remote) = tokio::io::duplex(1024);
    let mut ws = WebSocket::from_stream(
        local,
        Role::Client,
        Bytes::new(),
        Options::default().with_masking(Masking::fixed(&MASK)?),
    );

    ws.write_text("Hello")?;
    ws.flush().await?;

    let mut buf = [0u8; 11];
    remote.read_exact(&mut buf).await?;
    assert_eq!(
        buf,
        [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
    );

    ws.set_masking(Masking::None);
    ws.write_binary(&[1u8, 2])?;
    ws.flush().await?;

    let mut buf = [0u8; 4];
    remote.read_exact(&mut buf).await?;
    assert_eq!(buf, [0x82, 0x02, 1, 2]);
    Ok(())
}

#[tokio::test]
async fn payload_sizes_round_trip_in_every_mode() -> anyhow::Result<()> {
    const SIZES: [usize; 7] = [0, 1, 125, 126, 65535, 65536, 16 * 1024 * 1024];

    for mode in [
        FrameReceiveMode::Standard,
        FrameReceiveMode::Simple,
        FrameReceiveMode::Lite,
    ] {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let options = Options::default().with_frame_receive_mode(mode);
        let mut client =
            WebSocket::from_stream(local, Role::Client, Bytes::new(), options.clone());
        let mut server = WebSocket::from_stream(remote, Role::Server, Bytes::new(), options);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            while let Some(event) = server.next().await {
                if let Event::Message(message) = event {
                    let _ = tx.send(tokio::spawn(message.into_bytes()));
                }
            }
        });

        for size in SIZES {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            client.write_binary(payload.clone())?;
            client.flush().await?;

            let received = rx.recv().await.expect("message").await??;
            assert_eq!(received.len(), size, "{mode:?}");
            assert!(received[..] == payload[..], "{mode:?} size {size}");
        }

        client.destroy();
        driver.await?;
    }
    Ok(())
}

#[tokio::test]
async fn decoding_is_independent_of_split_points() -> anyhow::Result<()> {
    let bytes = client_bytes([
        Frame::text("first"),
        Frame::ping("p"),
        Frame::binary(vec![7u8; 300]),
        Frame::text("frag").with_fin(false),
        Frame::continuation("mented"),
        Frame::close(CloseCode::Normal),
    ]);

    let mut results = Vec::new();
    for split in [1, 2, 3, 7, 64, bytes.len()] {
        let (mut ws, mut remote) = server(FrameReceiveMode::Simple);
        for chunk in bytes.chunks(split) {
            remote.write_all(chunk).await?;
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            let Message::Simple(message) = next_message(&mut ws).await else {
                panic!("simple mode produced a stream");
            };
            seen.push((message.opcode(), message.to_bytes()));
        }
        results.push(seen);
    }

    assert_eq!(results[0][0], (OpCode::Text, Bytes::from_static(b"first")));
    assert_eq!(results[0][1], (OpCode::Ping, Bytes::from_static(b"p")));
    assert_eq!(results[0][2].1.len(), 300);
    assert_eq!(results[0][3], (OpCode::Text, Bytes::from_static(b"fragmented")));
    assert_eq!(results[0][4].0, OpCode::Close);
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    Ok(())
}

#[tokio::test]
async fn standard_mode_streams_fragments() -> anyhow::Result<()> {
    let (mut ws, mut remote) = server(FrameReceiveMode::Standard);

    remote
        .write_all(&client_bytes([
            Frame::text("Hel").with_fin(false),
            Frame::continuation("lo, ").with_fin(false),
            Frame::continuation("world"),
        ]))
        .await?;

    let message = next_message(&mut ws).await;
    assert_eq!(message.opcode(), OpCode::Text);
    assert!(matches!(message, Message::Stream(_)));

    let reader = tokio::spawn(message.into_chunks());
    let driver = tokio::spawn(async move { drain_events(&mut ws).await });

    let chunks = reader.await??;
    assert_eq!(chunks.concat(), b"Hello, world");

    drop(remote);
    driver.await?;
    Ok(())
}

#[tokio::test]
async fn lite_mode_rejects_fragments() -> anyhow::Result<()> {
    let (mut ws, mut remote) = server(FrameReceiveMode::Lite);

    remote
        .write_all(&client_bytes([Frame::text("half").with_fin(false)]))
        .await?;

    match ws.next().await {
        Some(Event::Error(WebSocketError::FrameBroken)) => {}
        other => panic!("expected a frame broken error, got {other:?}"),
    }
    ws.flush().await?;

    let mut buf = [0u8; 4];
    remote.read_exact(&mut buf).await?;
    assert_eq!(buf, [0x88, 0x02, 0x03, 0xEA]);
    Ok(())
}

#[tokio::test]
async fn oversized_message_closes_with_1009() -> anyhow::Result<()> {
    let (mut ws, mut remote) = server_with(
        Options::default()
            .with_frame_receive_mode(FrameReceiveMode::Simple)
            .with_max_message_size(16),
    );

    remote
        .write_all(&client_bytes([
            Frame::binary(vec![0u8; 10]).with_fin(false),
            Frame::continuation(vec![0u8; 10]),
        ]))
        .await?;

    match ws.next().await {
        Some(Event::Error(err)) => {
            assert!(matches!(err, WebSocketError::MessageTooLarge));
            assert_eq!(err.close_code(), CloseCode::Size);
        }
        other => panic!("expected a message too large error, got {other:?}"),
    }
    ws.flush().await?;

    let mut buf = [0u8; 4];
    remote.read_exact(&mut buf).await?;
    assert_eq!(buf, [0x88, 0x02, 0x03, 0xF1]);
    Ok(())
}

#[tokio::test]
async fn writes_queue_behind_message_writer() -> anyhow::Result<()> {
    let (mut ws, mut remote) = server(FrameReceiveMode::Standard);

    let mut writer = ws.message_writer(OpCode::Text)?;
    writer.write(&mut ws, "a")?;
    ws.write_text("queued")?;
    ws.ping("p")?;
    writer.write(&mut ws, Payload::empty())?;
    writer.end(&mut ws, "b")?;
    assert!(writer.is_ended());
    ws.flush().await?;

    let mut buf = vec![0u8; 3 + 2 + 3 + 8 + 3];
    remote.read_exact(&mut buf).await?;
    assert_eq!(
        buf,
        [
            0x01, 0x01, b'a', // first fragment
            0x00, 0x00, // empty continuation
            0x80, 0x01, b'b', // final fragment
            0x81, 0x06, b'q', b'u', b'e', b'u', b'e', b'd', // queued text
            0x89, 0x01, b'p', // queued ping
        ]
    );
    Ok(())
}

#[tokio::test]
async fn end_is_queued_behind_message_writer() -> anyhow::Result<()> {
    let (mut ws, mut remote) = server(FrameReceiveMode::Standard);

    let mut writer = ws.message_writer(OpCode::Binary)?;
    assert!(ws.end(CloseCode::Away));
    assert!(ws.is_writable());

    writer.end(&mut ws, vec![9u8])?;
    assert!(!ws.is_writable());
    ws.flush().await?;

    let mut buf = [0u8; 7];
    remote.read_exact(&mut buf).await?;
    assert_eq!(buf, [0x82, 0x01, 9, 0x88, 0x02, 0x03, 0xE9]);
    Ok(())
}

#[tokio::test]
async fn close_from_peer_is_answered() -> anyhow::Result<()> {
    let (mut ws, mut remote) = server(FrameReceiveMode::Simple);

    remote
        .write_all(&client_bytes([Frame::close(CloseCode::Normal)]))
        .await?;
    remote.shutdown().await?;

    let events = drain_events(&mut ws).await;

    let Some(Event::Message(Message::Simple(close))) = events.first() else {
        panic!("expected the close message first, got {events:?}");
    };
    assert_eq!(close.close_code(), Some(CloseCode::Normal));
    assert!(events.iter().any(|e| matches!(e, Event::End)));
    assert!(events.iter().any(|e| matches!(e, Event::Finish)));
    assert!(matches!(events.last(), Some(Event::Close)));
    assert!(!ws.is_connected());

    let mut reply = Vec::new();
    remote.read_to_end(&mut reply).await?;
    assert_eq!(reply, [0x88, 0x02, 0x03, 0xE8]);
    Ok(())
}

#[tokio::test]
async fn peer_eof_ends_connection() -> anyhow::Result<()> {
    let (mut ws, remote) = server(FrameReceiveMode::Standard);
    drop(remote);

    let events = drain_events(&mut ws).await;
    assert!(matches!(events.first(), Some(Event::End)));
    assert!(matches!(events.last(), Some(Event::Close)));
    assert!(ws.is_ended());
    assert!(ws.is_finished());
    Ok(())
}

#[tokio::test]
async fn open_stream_is_aborted_on_destroy() -> anyhow::Result<()> {
    let (mut ws, mut remote) = server(FrameReceiveMode::Standard);

    remote
        .write_all(&client_bytes([Frame::binary("partial").with_fin(false)]))
        .await?;

    let Message::Stream(mut stream) = next_message(&mut ws).await else {
        panic!("standard mode produced a simple message");
    };

    let mut chunks = Vec::new();
    ws.destroy();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk);
    }

    assert!(matches!(
        chunks.last(),
        Some(Err(WebSocketError::MessageAborted))
    ));
    Ok(())
}

#[tokio::test]
async fn control_frames_are_surfaced_not_answered() -> anyhow::Result<()> {
    let (mut ws, mut remote) = server(FrameReceiveMode::Lite);

    remote.write_all(&client_bytes([Frame::ping("are you there")])).await?;

    let message = next_message(&mut ws).await;
    assert_eq!(message.opcode(), OpCode::Ping);
    let data = message.into_bytes().await?;

    ws.pong(data)?;
    ws.flush().await?;

    let mut buf = vec![0u8; 2 + 13];
    remote.read_exact(&mut buf).await?;
    assert_eq!(&buf[..2], [0x8A, 13]);
    assert_eq!(&buf[2..], b"are you there");
    Ok(())
}
