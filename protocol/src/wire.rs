//! Primitive readers and writers shared by the packet and frame codecs.
//!
//! RakNet mixes big-endian fields with little-endian 24-bit counters and a
//! bit-inverted IPv4 address encoding; these helpers keep that in one place.

use crate::error::{CodecError, Result};
use crate::OFFLINE_MAGIC;
use bytes::{Buf, BufMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// Address family value written for IPv6 addresses (Windows `AF_INET6`).
const AF_INET6: u16 = 23;

/// Checked reads over any `Buf`.
pub trait ReadExt: Buf {
    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.get_u8())
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn read_u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.get_u16())
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.get_u32())
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.get_u64())
    }

    fn read_u24_le(&mut self) -> Result<u32> {
        self.need(3)?;
        let b0 = self.get_u8() as u32;
        let b1 = self.get_u8() as u32;
        let b2 = self.get_u8() as u32;
        Ok(b0 | (b1 << 8) | (b2 << 16))
    }

    fn read_magic(&mut self) -> Result<()> {
        self.need(OFFLINE_MAGIC.len())?;
        let mut magic = [0u8; 16];
        self.copy_to_slice(&mut magic);
        if magic != OFFLINE_MAGIC {
            return Err(CodecError::BadMagic);
        }
        Ok(())
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        self.need(len)?;
        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn read_address(&mut self) -> Result<SocketAddr> {
        match self.read_u8()? {
            4 => {
                self.need(6)?;
                let mut octets = [0u8; 4];
                self.copy_to_slice(&mut octets);
                let octets = octets.map(|b| !b);
                let port = self.get_u16();
                Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
            }
            6 => {
                self.need(28)?;
                let _family = self.get_u16_le();
                let port = self.get_u16();
                let flow_info = self.get_u32();
                let mut octets = [0u8; 16];
                self.copy_to_slice(&mut octets);
                let scope_id = self.get_u32();
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(octets),
                    port,
                    flow_info,
                    scope_id,
                )))
            }
            other => Err(CodecError::BadAddressVersion(other)),
        }
    }
}

impl<B: Buf> ReadExt for B {}

/// Writers matching [`ReadExt`].
pub trait WriteExt: BufMut {
    fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    fn put_u24_le(&mut self, value: u32) {
        self.put_u8((value & 0xff) as u8);
        self.put_u8(((value >> 8) & 0xff) as u8);
        self.put_u8(((value >> 16) & 0xff) as u8);
    }

    fn put_magic(&mut self) {
        self.put_slice(&OFFLINE_MAGIC);
    }

    fn put_string(&mut self, value: &str) -> Result<()> {
        let len = u16::try_from(value.len()).map_err(|_| CodecError::StringTooLong(value.len()))?;
        self.put_u16(len);
        self.put_slice(value.as_bytes());
        Ok(())
    }

    fn put_address(&mut self, addr: &SocketAddr) {
        match addr {
            SocketAddr::V4(v4) => {
                self.put_u8(4);
                for b in v4.ip().octets() {
                    self.put_u8(!b);
                }
                self.put_u16(v4.port());
            }
            SocketAddr::V6(v6) => {
                self.put_u8(6);
                self.put_u16_le(AF_INET6);
                self.put_u16(v6.port());
                self.put_u32(v6.flowinfo());
                self.put_slice(&v6.ip().octets());
                self.put_u32(v6.scope_id());
            }
        }
    }
}

impl<B: BufMut> WriteExt for B {}

/// Encoded size of an address in bytes.
pub fn address_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => 7,
        SocketAddr::V6(_) => 29,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_ipv4_address_is_bit_inverted() {
        let addr: SocketAddr = "127.0.0.1:19132".parse().unwrap();
        let mut buf = BytesMut::new();
        buf.put_address(&addr);

        assert_eq!(buf.len(), address_len(&addr));
        assert_eq!(&buf[..5], &[4, !127u8, 0xff, 0xff, !1u8]);
        assert_eq!(&buf[5..], &19132u16.to_be_bytes());

        let mut slice = &buf[..];
        assert_eq!(slice.read_address().unwrap(), addr);
    }

    #[test]
    fn test_ipv6_address_layout() {
        let addr: SocketAddr = "[::1]:19133".parse().unwrap();
        let mut buf = BytesMut::new();
        buf.put_address(&addr);

        assert_eq!(buf.len(), 29);
        assert_eq!(buf[0], 6);
        assert_eq!(&buf[1..3], &23u16.to_le_bytes());

        let mut slice = &buf[..];
        assert_eq!(slice.read_address().unwrap(), addr);
    }

    #[test]
    fn test_unknown_address_version() {
        let mut slice: &[u8] = &[5, 0, 0];
        assert_eq!(slice.read_address(), Err(CodecError::BadAddressVersion(5)));
    }

    #[test]
    fn test_u24_little_endian() {
        let mut buf = BytesMut::new();
        buf.put_u24_le(0x0a0b0c);
        assert_eq!(&buf[..], &[0x0c, 0x0b, 0x0a]);

        let mut slice = &buf[..];
        assert_eq!(slice.read_u24_le().unwrap(), 0x0a0b0c);
    }

    #[test]
    fn test_truncated_read_reports_sizes() {
        let mut slice: &[u8] = &[1, 2, 3];
        assert_eq!(
            slice.read_u64(),
            Err(CodecError::Truncated {
                needed: 8,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_bad_magic() {
        let mut slice: &[u8] = &[0u8; 16];
        assert_eq!(slice.read_magic(), Err(CodecError::BadMagic));
    }
}
