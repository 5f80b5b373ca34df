//! DNS-truncate helper: a UDP listener that answers every well-formed DNS
//! query with the query itself, marked as a truncated reply. Resolvers then
//! retry over TCP, where they can be captured and redirected like any other
//! TCP flow.
use crate::config::DnstcConfig;
use crate::{Result, Shutdown};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{info, warn};

const DNS_HEADER_LEN: usize = 12;

const DNS_QR: u8 = 0x80;
const DNS_TC: u8 = 0x02;
const DNS_Z: u8 = 0x70;

pub(crate) async fn bind(config: &DnstcConfig) -> Result<UdpSocket> {
    Ok(UdpSocket::bind(SocketAddr::V4(config.listen)).await?)
}

/// Turn a datagram into its truncated reply in place. Only a plain query is
/// eligible: `QR=0`, a zero Z field, at least one question and no answer,
/// authority or additional records. Returns `false` otherwise.
fn truncate_in_place(pkt: &mut [u8]) -> bool {
    if pkt.len() < DNS_HEADER_LEN {
        return false;
    }
    let qdcount = u16::from_be_bytes([pkt[4], pkt[5]]);
    let ancount = u16::from_be_bytes([pkt[6], pkt[7]]);
    let nscount = u16::from_be_bytes([pkt[8], pkt[9]]);
    let arcount = u16::from_be_bytes([pkt[10], pkt[11]]);

    let eligible = pkt[2] & DNS_QR == 0
        && pkt[3] & DNS_Z == 0
        && qdcount > 0
        && ancount == 0
        && nscount == 0
        && arcount == 0;
    if eligible {
        pkt[2] |= DNS_QR | DNS_TC;
    }
    eligible
}

/// Serve one DNS-truncate socket until shutdown. Malformed datagrams are
/// logged and ignored; this helper has no other state.
pub(crate) async fn run(socket: UdpSocket, mut shutdown: Shutdown) {
    if let Ok(addr) = socket.local_addr() {
        info!(%addr, "answering DNS queries with truncated replies");
    }

    let mut buf = [0u8; 0xffff];
    loop {
        let (len, peer) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(err) => {
                    warn!(cause = %err, "recvfrom");
                    continue;
                }
            },
            _ = shutdown.recv() => return,
        };

        if len < DNS_HEADER_LEN {
            info!(client = %peer, "incomplete DNS request");
            continue;
        }
        if !truncate_in_place(&mut buf[..len]) {
            info!(client = %peer, "malformed DNS request");
            continue;
        }
        match socket.send_to(&buf[..len], peer).await {
            Ok(sent) if sent == len => info!(client = %peer, "sent truncated DNS reply"),
            Ok(sent) => warn!(
                client = %peer,
                "sendto: I was sending {len} bytes, but only {sent} were sent"
            ),
            Err(err) => warn!(client = %peer, cause = %err, "sendto"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;
    use std::time::Duration;
    use tokio::sync::broadcast;

    /// A 20-byte A query shaped like `example.com`'s first label would be,
    /// cut down to fit: header + a short question section.
    fn query() -> Vec<u8> {
        let mut pkt = vec![
            0x12, 0x34, // id
            0x01, 0x00, // RD set, QR clear
            0x00, 0x01, // qdcount
            0x00, 0x00, // ancount
            0x00, 0x00, // nscount
            0x00, 0x00, // arcount
        ];
        pkt.extend_from_slice(b"\x03foo\x00\x00\x01\x00"); // question bytes
        pkt
    }

    #[test]
    fn query_gets_qr_and_tc_set_and_nothing_else() {
        let original = query();
        let mut pkt = original.clone();
        assert!(truncate_in_place(&mut pkt));

        assert_eq!(pkt[2], original[2] | 0x80 | 0x02);
        assert_eq!(pkt[..2], original[..2]);
        assert_eq!(pkt[3..], original[3..]);
    }

    #[test]
    fn header_only_query_is_still_eligible() {
        let mut pkt = query();
        pkt.truncate(DNS_HEADER_LEN);
        assert!(truncate_in_place(&mut pkt));
    }

    #[test]
    fn responses_and_answers_are_ignored() {
        let mut pkt = query();
        pkt[2] |= 0x80; // already a response
        assert!(!truncate_in_place(&mut pkt));

        let mut pkt = query();
        pkt[7] = 1; // ancount
        assert!(!truncate_in_place(&mut pkt));

        let mut pkt = query();
        pkt[3] |= 0x40; // reserved Z bit
        assert!(!truncate_in_place(&mut pkt));

        let mut pkt = query();
        pkt[5] = 0; // no questions
        assert!(!truncate_in_place(&mut pkt));
    }

    #[test]
    fn short_datagrams_are_ignored() {
        let mut pkt = query();
        pkt.truncate(DNS_HEADER_LEN - 1);
        assert!(!truncate_in_place(&mut pkt));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn echoes_queries_as_truncated_replies() {
        let socket = bind(&DnstcConfig {
            listen: SocketAddrV4::new([127, 0, 0, 1].into(), 0),
        })
        .await
        .unwrap();
        let server_addr = socket.local_addr().unwrap();

        let (notify_shutdown, _) = broadcast::channel(1);
        let helper = tokio::spawn(run(socket, Shutdown::new(notify_shutdown.subscribe())));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&query(), server_addr).await.unwrap();

        let mut buf = [0u8; 512];
        let (len, from) = tokio::time::timeout(
            Duration::from_secs(5),
            client.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(from, server_addr);

        let mut expected = query();
        assert!(truncate_in_place(&mut expected));
        assert_eq!(&buf[..len], &expected[..]);

        drop(notify_shutdown);
        tokio::time::timeout(Duration::from_secs(5), helper)
            .await
            .unwrap()
            .unwrap();
    }
}
