//! End-to-end uploads over a loopback socket against a simulated Wi-Fi bridge.

use sketchlink::{
    Error, HexOptions, ProgramImage, ReplyCode, Sketch, TcpConfig, TcpTransport, UploadConfig,
    Uploader,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const BLINK_HEX: &str = "\
:100000000C94C7010C94EF010C94EF010C94EF01D8
:100010000C94EF010C94EF010C94EF010C94EF01A0
:100020000C94EF010C94EF010C94EF010C94EF0190
:0A0030000C94EF010C94EF010C9406
:00000001FF
";

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What the simulated device does with a packet.
#[derive(Clone, Copy)]
enum Behaviour {
    Ack,
    Reply(u8),
    HangUp,
}

/// Packets received by the simulated device, without the CR LF suffix.
type Received = Vec<Vec<u8>>;

/// Read one packet: header, body by length byte, then CR LF.
fn read_packet(socket: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; 4];
    socket.read_exact(&mut header).ok()?;
    assert_eq!(&header[..2], &[0xEF, 0xAC], "packet magic");

    let mut packet = header.to_vec();
    let mut body = vec![0u8; usize::from(header[3]) - header.len()];
    socket.read_exact(&mut body).ok()?;
    packet.extend_from_slice(&body);

    let mut crlf = [0u8; 2];
    socket.read_exact(&mut crlf).ok()?;
    assert_eq!(&crlf, b"\r\n", "packet terminator");
    Some(packet)
}

/// Spawn a bridge that applies `behave(packet_index, packet)` to every packet.
fn spawn_device<F>(behave: F) -> (u16, JoinHandle<Received>)
where
    F: Fn(usize, &[u8]) -> Behaviour + Send + 'static,
{
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (mut socket, _) = server.accept().unwrap();
        let mut received = Vec::new();

        while let Some(packet) = read_packet(&mut socket) {
            let index = received.len();
            received.push(packet.clone());

            let id = [packet[4], packet[5]];
            let code = match behave(index, &packet) {
                Behaviour::Ack => 0x01,
                Behaviour::Reply(code) => code,
                Behaviour::HangUp => break,
            };
            socket
                .write_all(&[0xEF, 0xAC, code, id[0], id[1], b'\r', b'\n'])
                .unwrap();
        }
        received
    });

    (port, handle)
}

fn uploader(port: u16) -> Uploader<TcpTransport> {
    let transport = TcpTransport::new(
        TcpConfig::new("127.0.0.1", port)
            .with_connect_timeout(Duration::from_secs(5))
            .with_read_timeout(Duration::from_millis(100)),
    );
    let config = UploadConfig::default()
        .with_ack_timeout(Duration::from_secs(2))
        .with_retry_delay(Duration::from_millis(10))
        .with_max_retries(3);
    Uploader::new(transport, config)
}

fn blink_sketch(page_size: usize) -> Sketch {
    let image = ProgramImage::from_hex_str(BLINK_HEX, HexOptions::strict()).unwrap();
    Sketch::new(image, page_size).unwrap()
}

#[test]
fn test_upload_blink_over_tcp() {
    init_logger();
    let sketch = blink_sketch(26);
    assert_eq!(sketch.total_size(), 58);

    let (port, device) = spawn_device(|_, _| Behaviour::Ack);
    let mut uploader = uploader(port);

    let mut last_progress = (0, 0);
    let report = uploader
        .upload(&sketch, |done, total| last_progress = (done, total))
        .unwrap();

    assert_eq!(report.size, 58);
    assert_eq!(report.pages, 3);
    assert_eq!(report.retries, 0);
    assert_eq!(last_progress, (3, 3));

    let received = device.join().unwrap();
    assert_eq!(received.len(), 1 + 3 + 1);
    assert_eq!(
        received[0],
        vec![0xEF, 0xAC, 0x10, 11, 0x00, 58, 0x00, 3, 26, 60, 1]
    );
    assert_eq!(received[4], vec![0xEF, 0xAC, 0x40, 6, 0x00, 58]);

    // The device rebuilds the image from word addresses and page data
    let mut rebuilt = vec![0u8; 58];
    for packet in &received[1..4] {
        assert_eq!(packet[2], 0x20);
        let word = usize::from(u16::from_be_bytes([packet[4], packet[5]]));
        let data = &packet[6..];
        rebuilt[word * 2..word * 2 + data.len()].copy_from_slice(data);
    }
    assert_eq!(rebuilt, sketch.image().as_bytes());
}

#[test]
fn test_device_start_over_aborts_upload() {
    init_logger();
    let sketch = blink_sketch(26);

    // Packet 2 is the second page
    let (port, device) = spawn_device(|index, _| {
        if index == 2 {
            Behaviour::Reply(0x02)
        } else {
            Behaviour::Ack
        }
    });
    let mut uploader = uploader(port);

    let err = uploader.upload(&sketch, |_, _| {}).unwrap_err();
    assert!(matches!(
        err,
        Error::DeviceResyncRequired(ReplyCode::StartOver)
    ));

    let received = device.join().unwrap();
    assert_eq!(received.len(), 3);
}

#[test]
fn test_device_hangup_is_a_transport_error() {
    init_logger();
    let sketch = blink_sketch(26);

    let (port, device) = spawn_device(|index, _| {
        if index == 1 {
            Behaviour::HangUp
        } else {
            Behaviour::Ack
        }
    });
    let mut uploader = uploader(port);

    let err = uploader.upload(&sketch, |_, _| {}).unwrap_err();
    assert!(
        matches!(err, Error::Transport(_) | Error::UploadFailed { .. }),
        "unexpected error: {err}"
    );
    device.join().unwrap();
}

#[test]
fn test_nothing_listening_is_an_open_error() {
    init_logger();
    let port = {
        let socket = TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };
    let mut uploader = uploader(port);

    let err = uploader.upload(&blink_sketch(26), |_, _| {}).unwrap_err();
    assert!(matches!(err, Error::TransportOpen { .. }));
}
