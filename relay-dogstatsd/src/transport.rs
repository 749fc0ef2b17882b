//! Datagram transports to the agent.

use std::io;
use std::net::{Ipv4Addr, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixDatagram;
#[cfg(unix)]
use std::path::Path;
use std::sync::Arc;

/// Maximum safe payload of a UDP datagram on the common 1500 byte MTU.
pub const UDP_MAX_PACKET_SIZE: usize = 1432;

/// Default payload of a Unix datagram.
pub const UDS_MAX_PACKET_SIZE: usize = 8192;

/// A channel that writes entire packets.
///
/// Writes may fail or write fewer bytes than requested, both of which the sender accounts as
/// dropped packets. Implementations are shared among all sender threads.
pub trait Transport: Send + Sync {
    /// Writes a single packet and returns the number of bytes written.
    fn write(&self, packet: &[u8]) -> io::Result<usize>;

    /// Closes the transport. Writes after closing fail.
    fn close(&self) -> io::Result<()> {
        Ok(())
    }

    /// Largest packet this transport can deliver.
    fn max_packet_size(&self) -> usize;

    /// Short name of the transport reported in telemetry.
    fn name(&self) -> &'static str;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        (**self).write(packet)
    }

    fn close(&self) -> io::Result<()> {
        (**self).close()
    }

    fn max_packet_size(&self) -> usize {
        (**self).max_packet_size()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        (**self).write(packet)
    }

    fn close(&self) -> io::Result<()> {
        (**self).close()
    }

    fn max_packet_size(&self) -> usize {
        (**self).max_packet_size()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// A connected, non-blocking UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds an ephemeral local port and connects it to `addr`.
    pub fn connect(addr: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(addr)?;
        socket.set_nonblocking(true)?;

        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        self.socket.send(packet)
    }

    fn max_packet_size(&self) -> usize {
        UDP_MAX_PACKET_SIZE
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}

/// A connected, non-blocking Unix datagram socket.
#[cfg(unix)]
#[derive(Debug)]
pub struct UnixDatagramTransport {
    socket: UnixDatagram,
}

#[cfg(unix)]
impl UnixDatagramTransport {
    pub fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;
        socket.set_nonblocking(true)?;

        Ok(Self { socket })
    }
}

#[cfg(unix)]
impl Transport for UnixDatagramTransport {
    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        self.socket.send(packet)
    }

    fn close(&self) -> io::Result<()> {
        match self.socket.shutdown(std::net::Shutdown::Both) {
            Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(()),
            result => result,
        }
    }

    fn max_packet_size(&self) -> usize {
        UDS_MAX_PACKET_SIZE
    }

    fn name(&self) -> &'static str {
        "uds"
    }
}

/// Opens a transport for an agent address.
///
/// The address is either a URL whose scheme names the transport, such as `udp://127.0.0.1:8125`
/// or `unixgram:///var/run/datadog/dsd.socket`, or a plain `host:port` for UDP.
pub fn connect(addr: &str) -> io::Result<Box<dyn Transport>> {
    // Try treating the address as a fully-qualified URL, where the scheme is the transport identifier.
    if let Some((scheme, path)) = addr.split_once("://") {
        return match scheme {
            "udp" => Ok(Box::new(UdpTransport::connect(path)?)),
            #[cfg(unix)]
            "unixgram" => Ok(Box::new(UnixDatagramTransport::connect(path)?)),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid scheme '{scheme}', expected one of 'udp', 'unixgram'"),
            )),
        };
    }

    Ok(Box::new(UdpTransport::connect(addr)?))
}

#[cfg(any(test, feature = "test"))]
pub use self::capture::*;

#[cfg(any(test, feature = "test"))]
mod capture {
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::Transport;

    /// How a [`CapturingTransport`] responds to writes.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub enum WriteBehavior {
        /// Captures the packet and reports a complete write.
        #[default]
        Capture,
        /// Fails every write.
        Fail,
        /// Reports that only half of the packet was written.
        ShortWrite,
    }

    /// A transport that records all packets in memory.
    #[derive(Debug, Default)]
    pub struct CapturingTransport {
        packets: Mutex<Vec<Vec<u8>>>,
        behavior: Mutex<WriteBehavior>,
        max_packet_size: usize,
        closed: AtomicBool,
    }

    impl CapturingTransport {
        /// Creates a transport delivering packets of up to `max_packet_size` bytes.
        pub fn new(max_packet_size: usize) -> Arc<Self> {
            Arc::new(Self {
                max_packet_size,
                ..Default::default()
            })
        }

        /// Changes how subsequent writes behave.
        pub fn set_behavior(&self, behavior: WriteBehavior) {
            *self.behavior.lock() = behavior;
        }

        /// Returns all captured packets as strings.
        pub fn packets(&self) -> Vec<String> {
            self.packets
                .lock()
                .iter()
                .map(|packet| String::from_utf8_lossy(packet).into_owned())
                .collect()
        }

        /// Returns all lines across all captured packets.
        pub fn lines(&self) -> Vec<String> {
            self.packets()
                .iter()
                .flat_map(|packet| packet.split('\n'))
                .map(str::to_owned)
                .collect()
        }

        /// Returns `true` once the transport has been closed.
        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Relaxed)
        }
    }

    impl Transport for CapturingTransport {
        fn write(&self, packet: &[u8]) -> io::Result<usize> {
            if self.is_closed() {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
            }

            match *self.behavior.lock() {
                WriteBehavior::Capture => {
                    self.packets.lock().push(packet.to_vec());
                    Ok(packet.len())
                }
                WriteBehavior::Fail => Err(io::Error::other("agent unreachable")),
                WriteBehavior::ShortWrite => Ok(packet.len() / 2),
            }
        }

        fn close(&self) -> io::Result<()> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn max_packet_size(&self) -> usize {
            self.max_packet_size
        }

        fn name(&self) -> &'static str {
            "test"
        }
    }
}
