use crate::{FrameError, BROADCAST_ADDR};

/// Bytes preceding the payload: length, destination, source, control
pub const HEADER_LEN: usize = 4;

/// RFM69 FIFO is 66 bytes, minus the length/address/control bytes
/// and the AES block overhead
pub const MAX_PAYLOAD_LEN: usize = 61;

/// Control bit set on an acknowledgment frame
pub const ACK_SENT: u8 = 0x80;
/// Control bit set by a sender that wants an acknowledgment
pub const ACK_REQUESTED: u8 = 0x40;

/// A single RFM69 packet. Encoding is `len | to | from | ctl | payload`
/// where `len` counts every byte after itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioPacket {
    pub to: u8,
    pub from: u8,
    pub request_ack: bool,
    pub is_ack: bool,
    payload: [u8; MAX_PAYLOAD_LEN],
    payload_len: u8,
}

impl RadioPacket {
    pub fn new(to: u8, from: u8, payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge { len: payload.len() });
        }
        let mut buf = [0u8; MAX_PAYLOAD_LEN];
        buf[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            to,
            from,
            request_ack: false,
            is_ack: false,
            payload: buf,
            payload_len: payload.len() as u8,
        })
    }

    pub fn with_ack_request(mut self) -> Self {
        self.request_ack = true;
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_ADDR
    }

    /// Build the reply acknowledging this packet: addresses swapped,
    /// ACK bit set, empty payload.
    pub fn to_ack(&self) -> Self {
        Self {
            to: self.from,
            from: self.to,
            request_ack: false,
            is_ack: true,
            payload: [0u8; MAX_PAYLOAD_LEN],
            payload_len: 0,
        }
    }

    fn control(&self) -> u8 {
        let mut ctl = 0;
        if self.is_ack {
            ctl |= ACK_SENT;
        }
        if self.request_ack {
            ctl |= ACK_REQUESTED;
        }
        ctl
    }

    /// Encode into `buf`, returning the number of bytes written. `buf` must
    /// hold at least `HEADER_LEN + MAX_PAYLOAD_LEN` bytes.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let len = HEADER_LEN + self.payload_len as usize;
        buf[0] = (len - 1) as u8;
        buf[1] = self.to;
        buf[2] = self.from;
        buf[3] = self.control();
        buf[HEADER_LEN..len].copy_from_slice(self.payload());
        len
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::HeaderTruncated);
        }
        let declared = buf[0] as usize + 1;
        if declared != buf.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }
        let ctl = buf[3];
        let mut packet = Self::new(buf[1], buf[2], &buf[HEADER_LEN..])?;
        packet.is_ack = ctl & ACK_SENT != 0;
        packet.request_ack = ctl & ACK_REQUESTED != 0;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Metric;

    #[test]
    fn encodes_header_then_payload() {
        let packet = RadioPacket::new(1, 7, &[0xaa, 0xbb])
            .unwrap()
            .with_ack_request();
        let mut buf = [0u8; HEADER_LEN + MAX_PAYLOAD_LEN];
        let len = packet.encode(&mut buf);
        assert_eq!(&buf[..len], &[5, 1, 7, ACK_REQUESTED, 0xaa, 0xbb]);
        assert_eq!(RadioPacket::decode(&buf[..len]), Ok(packet));
    }

    #[test]
    fn carries_a_telemetry_frame() {
        let metric = Metric {
            temperature: 18.25,
            rssi: -70,
            ..Default::default()
        };
        let packet = RadioPacket::new(1, 12, &metric.encode()).unwrap();
        let mut buf = [0u8; HEADER_LEN + MAX_PAYLOAD_LEN];
        let len = packet.encode(&mut buf);

        let decoded = RadioPacket::decode(&buf[..len]).unwrap();
        assert_eq!(decoded.from, 12);
        assert_eq!(Metric::decode(decoded.payload()), Ok(metric));
    }

    #[test]
    fn ack_swaps_addresses() {
        let packet = RadioPacket::new(1, 7, &[1, 2, 3])
            .unwrap()
            .with_ack_request();
        let ack = packet.to_ack();
        assert_eq!(ack.to, 7);
        assert_eq!(ack.from, 1);
        assert!(ack.is_ack);
        assert!(!ack.request_ack);
        assert!(ack.payload().is_empty());
    }

    #[test]
    fn rejects_bad_lengths() {
        assert_eq!(
            RadioPacket::decode(&[3, 1, 2]),
            Err(FrameError::HeaderTruncated)
        );
        assert_eq!(
            RadioPacket::decode(&[9, 1, 2, 0, 0]),
            Err(FrameError::LengthMismatch {
                declared: 10,
                actual: 5
            })
        );
        assert_eq!(
            RadioPacket::new(1, 2, &[0u8; 62]),
            Err(FrameError::PayloadTooLarge { len: 62 })
        );
    }

    #[test]
    fn broadcast_detection() {
        assert!(RadioPacket::new(BROADCAST_ADDR, 3, &[]).unwrap().is_broadcast());
        assert!(!RadioPacket::new(1, 3, &[]).unwrap().is_broadcast());
    }
}
