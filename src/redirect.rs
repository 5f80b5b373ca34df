//! Original-destination discovery for redirected connections.
//!
//! The kernel facility that knows where a captured connection was really
//! headed differs per platform; the backend is picked once at startup from
//! the configuration and shared by every instance. Only the pf and IPFilter
//! backends carry state: an fd to the kernel NAT control device, held open
//! for the lifetime of the process.
use crate::config::RedirectorKind;
use crate::{Error, Result};
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use tokio::net::TcpStream;
use tracing::trace;

#[derive(Debug)]
pub enum Redirector {
    /// Linux netfilter: `getsockopt(SO_ORIGINAL_DST)`.
    #[cfg(target_os = "linux")]
    Iptables,
    /// BSD packet filter: `DIOCNATLOOK` on `/dev/pf`.
    #[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
    Pf(std::fs::File),
    /// IPFilter: `SIOCGNATL` on the NAT control device.
    #[cfg(target_os = "freebsd")]
    Ipf(std::fs::File),
    /// `getsockname`: the OS already rewrote the local address in place.
    Generic,
}

impl Redirector {
    /// Materialize the configured backend, opening its control device where
    /// one is needed. Backends not available on this platform are a
    /// configuration error.
    #[allow(unreachable_patterns)]
    pub fn open(kind: RedirectorKind) -> Result<Redirector> {
        match kind {
            RedirectorKind::Generic => Ok(Redirector::Generic),
            #[cfg(target_os = "linux")]
            RedirectorKind::Iptables => Ok(Redirector::Iptables),
            #[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
            RedirectorKind::Pf => {
                let dev = std::fs::File::options()
                    .read(true)
                    .write(true)
                    .open("/dev/pf")
                    .map_err(|err| Error::Config(format!("open(/dev/pf): {err}")))?;
                Ok(Redirector::Pf(dev))
            }
            #[cfg(target_os = "freebsd")]
            RedirectorKind::Ipf => {
                let dev = std::fs::File::open(ipf::IPNAT_DEVICE)
                    .map_err(|err| Error::Config(format!("open({}): {err}", ipf::IPNAT_DEVICE)))?;
                Ok(Redirector::Ipf(dev))
            }
            kind => Err(Error::Config(format!(
                "redirector `{kind}` is not supported on this platform"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(target_os = "linux")]
            Redirector::Iptables => "iptables",
            #[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
            Redirector::Pf(_) => "pf",
            #[cfg(target_os = "freebsd")]
            Redirector::Ipf(_) => "ipf",
            Redirector::Generic => "generic",
        }
    }

    /// Resolve the original destination of an accepted connection. Must not
    /// block meaningfully: every backend is a single syscall (the pf backend
    /// at most two).
    pub fn lookup(
        &self,
        stream: &TcpStream,
        client_addr: SocketAddrV4,
        bind_addr: SocketAddrV4,
    ) -> Result<SocketAddrV4> {
        trace!(%client_addr, %bind_addr, backend = self.name(), "destination lookup");
        let looked_up = match self {
            #[cfg(target_os = "linux")]
            Redirector::Iptables => netfilter::original_dst(stream),
            #[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
            Redirector::Pf(dev) => pf::nat_lookup(dev, client_addr, bind_addr),
            #[cfg(target_os = "freebsd")]
            Redirector::Ipf(dev) => ipf::nat_lookup(dev, client_addr, bind_addr),
            Redirector::Generic => generic_dst(stream),
        };
        looked_up.map_err(|source| Error::DestLookup {
            backend: self.name(),
            source,
        })
    }
}

/// `getsockname` fallback, valid for transparent modes that rewrite the
/// local address of the accepted socket.
fn generic_dst(stream: &TcpStream) -> io::Result<SocketAddrV4> {
    match stream.local_addr()? {
        SocketAddr::V4(addr) => Ok(addr),
        SocketAddr::V6(_) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ipv6 local address on a captured socket",
        )),
    }
}

#[cfg(target_os = "linux")]
mod netfilter {
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::unix::io::AsRawFd;
    use tokio::net::TcpStream;

    // from linux/netfilter_ipv4.h
    const SO_ORIGINAL_DST: libc::c_int = 80;

    pub(super) fn original_dst(stream: &TcpStream) -> io::Result<SocketAddrV4> {
        let fd = stream.as_raw_fd();
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
            u16::from_be(addr.sin_port),
        ))
    }
}

#[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
mod pf {
    use std::fs::File;
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::unix::io::AsRawFd;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct PfAddr {
        // union pf_addr; only the leading v4 part is used here
        bytes: [u8; 16],
    }

    #[repr(C)]
    struct PfiocNatlook {
        saddr: PfAddr,
        daddr: PfAddr,
        rsaddr: PfAddr,
        rdaddr: PfAddr,
        sport: u16,
        dport: u16,
        rsport: u16,
        rdport: u16,
        af: libc::sa_family_t,
        proto: u8,
        direction: u8,
    }

    const PF_IN: u8 = 1;
    const PF_OUT: u8 = 2;

    const fn iowr(group: u8, num: u8, len: usize) -> libc::c_ulong {
        // _IOWR from sys/ioccom.h
        0xc000_0000
            | (((len & 0x1fff) as libc::c_ulong) << 16)
            | ((group as libc::c_ulong) << 8)
            | num as libc::c_ulong
    }

    const DIOCNATLOOK: libc::c_ulong = iowr(b'D', 23, mem::size_of::<PfiocNatlook>());

    pub(super) fn nat_lookup(
        dev: &File,
        client: SocketAddrV4,
        bind: SocketAddrV4,
    ) -> io::Result<SocketAddrV4> {
        let mut nl: PfiocNatlook = unsafe { mem::zeroed() };
        nl.saddr.bytes[..4].copy_from_slice(&client.ip().octets());
        nl.sport = client.port().to_be();
        nl.daddr.bytes[..4].copy_from_slice(&bind.ip().octets());
        nl.dport = bind.port().to_be();
        nl.af = libc::AF_INET as libc::sa_family_t;
        nl.proto = libc::IPPROTO_TCP as u8;
        nl.direction = PF_OUT;

        let ret = unsafe { libc::ioctl(dev.as_raw_fd(), DIOCNATLOOK, &mut nl) };
        if ret != 0 {
            if io::Error::last_os_error().raw_os_error() != Some(libc::ENOENT) {
                return Err(io::Error::last_os_error());
            }
            // locally-originated packets show up in the inbound direction
            nl.direction = PF_IN;
            if unsafe { libc::ioctl(dev.as_raw_fd(), DIOCNATLOOK, &mut nl) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let mut octets = [0u8; 4];
        octets.copy_from_slice(&nl.rdaddr.bytes[..4]);
        Ok(SocketAddrV4::new(
            Ipv4Addr::from(octets),
            u16::from_be(nl.rdport),
        ))
    }
}

#[cfg(target_os = "freebsd")]
mod ipf {
    use std::fs::File;
    use std::io;
    use std::mem;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::unix::io::AsRawFd;

    pub(super) const IPNAT_DEVICE: &str = "/dev/ipnat";

    const IPN_TCP: i32 = 0x0000_0001;
    const IPFILTER_VERSION: u32 = 4_010_027;
    const IPFOBJ_NATLOOKUP: i32 = 11;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct I6Addr {
        // i6addr_t; the v4 address occupies the first word
        addr: [u32; 4],
    }

    #[repr(C)]
    struct NatLookup {
        nl_inipaddr: I6Addr,
        nl_outipaddr: I6Addr,
        nl_realipaddr: I6Addr,
        nl_v: i32,
        nl_flags: i32,
        nl_inport: u16,
        nl_outport: u16,
        nl_realport: u16,
    }

    #[repr(C)]
    struct IpfObj {
        ipfo_rev: u32,
        ipfo_size: u32,
        ipfo_ptr: *mut libc::c_void,
        ipfo_type: i32,
        ipfo_offset: i32,
        ipfo_xxxpad: [u8; 32],
    }

    const fn iowr(group: u8, num: u8, len: usize) -> libc::c_ulong {
        0xc000_0000
            | (((len & 0x1fff) as libc::c_ulong) << 16)
            | ((group as libc::c_ulong) << 8)
            | num as libc::c_ulong
    }

    const SIOCGNATL: libc::c_ulong = iowr(b'r', 63, mem::size_of::<IpfObj>());
    const SIOCGNATL_LEGACY: libc::c_ulong =
        iowr(b'r', 63, mem::size_of::<*mut NatLookup>());

    pub(super) fn nat_lookup(
        dev: &File,
        client: SocketAddrV4,
        bind: SocketAddrV4,
    ) -> io::Result<SocketAddrV4> {
        let mut nl: NatLookup = unsafe { mem::zeroed() };
        nl.nl_v = 4;
        nl.nl_flags = IPN_TCP;
        nl.nl_inipaddr.addr[0] = u32::from_ne_bytes(bind.ip().octets());
        nl.nl_inport = bind.port().to_be();
        nl.nl_outipaddr.addr[0] = u32::from_ne_bytes(client.ip().octets());
        nl.nl_outport = client.port().to_be();

        // >= 4.1.27 wraps the lookup in an ipfobj; older revisions take a
        // pointer to the struct pointer.
        let mut obj = IpfObj {
            ipfo_rev: IPFILTER_VERSION,
            ipfo_size: mem::size_of::<NatLookup>() as u32,
            ipfo_ptr: &mut nl as *mut _ as *mut libc::c_void,
            ipfo_type: IPFOBJ_NATLOOKUP,
            ipfo_offset: 0,
            ipfo_xxxpad: [0; 32],
        };
        let mut ret = unsafe { libc::ioctl(dev.as_raw_fd(), SIOCGNATL, &mut obj) };
        if ret != 0 {
            let errno = io::Error::last_os_error().raw_os_error();
            if errno == Some(libc::EINVAL) || errno == Some(libc::ENOTTY) {
                let mut nlp: *mut NatLookup = &mut nl;
                ret = unsafe { libc::ioctl(dev.as_raw_fd(), SIOCGNATL_LEGACY, &mut nlp) };
            }
        }
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(SocketAddrV4::new(
            Ipv4Addr::from(nl.nl_realipaddr.addr[0].to_ne_bytes()),
            u16::from_be(nl.nl_realport),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn generic_backend_returns_local_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound = match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            other => panic!("unexpected address {other}"),
        };

        let _client = TcpStream::connect(bound).await.unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();
        let peer = match peer {
            SocketAddr::V4(addr) => addr,
            other => panic!("unexpected address {other}"),
        };

        let redirector = Redirector::open(RedirectorKind::Generic).unwrap();
        let dest = redirector.lookup(&accepted, peer, bound).unwrap();
        assert_eq!(dest, bound);
    }

    #[test]
    fn unsupported_backend_fails_configuration() {
        #[cfg(target_os = "linux")]
        assert!(matches!(
            Redirector::open(RedirectorKind::Pf),
            Err(Error::Config(_))
        ));
        #[cfg(not(target_os = "linux"))]
        assert!(matches!(
            Redirector::open(RedirectorKind::Iptables),
            Err(Error::Config(_))
        ));
    }
}
