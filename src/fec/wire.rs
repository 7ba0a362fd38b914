use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::{FecDecoder, FecEncoder, MAX_SYMBOLS};
use crate::rtp::{ExtensionValues, Pt, RtpHeader, RtpPacket, SeqNo, Ssrc};
use crate::Error;

/// Size of `base_seq | k | esi` in front of the repair symbol.
pub const REPAIR_HEADER_LEN: usize = 6;

/// Recent media packets kept to be fed to groups whose repair arrives late.
const MEDIA_HISTORY: usize = 1024;

/// Recently decoded groups, to ignore their remaining repair packets.
const DONE_HISTORY: usize = 64;

/// Groups not decoded within this time are abandoned.
pub const GROUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Header of a repair packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairHeader {
    /// Sequence number of the first media packet of the group.
    pub base_seq: u16,
    /// Number of media packets in the group.
    pub k: u16,
    /// Encoding symbol id of this repair symbol.
    pub esi: u16,
}

impl RepairHeader {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.base_seq.to_be_bytes());
        buf.extend_from_slice(&self.k.to_be_bytes());
        buf.extend_from_slice(&self.esi.to_be_bytes());
    }
}

impl<'a> TryFrom<&'a [u8]> for RepairHeader {
    type Error = &'static str;

    fn try_from(buf: &'a [u8]) -> Result<Self, Self::Error> {
        if buf.len() < REPAIR_HEADER_LEN {
            return Err("Less than 6 bytes for FEC repair header");
        }

        let h = RepairHeader {
            base_seq: u16::from_be_bytes([buf[0], buf[1]]),
            k: u16::from_be_bytes([buf[2], buf[3]]),
            esi: u16::from_be_bytes([buf[4], buf[5]]),
        };

        if h.k == 0 || h.esi < h.k || h.esi as usize >= MAX_SYMBOLS {
            return Err("FEC repair header with bad k or esi");
        }

        Ok(h)
    }
}

/// A media packet as a source symbol: `len u16 | bytes`, zero padded.
fn to_source_symbol(raw: &[u8], symbol_size: usize) -> Option<Vec<u8>> {
    if raw.len() + 2 > symbol_size || raw.len() > u16::MAX as usize {
        return None;
    }
    let mut s = Vec::with_capacity(symbol_size);
    s.extend_from_slice(&(raw.len() as u16).to_be_bytes());
    s.extend_from_slice(raw);
    s.resize(symbol_size, 0);
    Some(s)
}

fn from_source_symbol(symbol: &[u8]) -> Option<&[u8]> {
    if symbol.len() < 2 {
        return None;
    }
    let len = u16::from_be_bytes([symbol[0], symbol[1]]) as usize;
    symbol.get(2..2 + len)
}

/// Produces repair packets protecting the media packets of a frame.
#[derive(Debug)]
pub struct FecSender {
    encoder: FecEncoder,
    ssrc: Ssrc,
    pt: Pt,
    seq_no: SeqNo,
}

impl FecSender {
    pub fn new(encoder: FecEncoder, ssrc: Ssrc, pt: Pt) -> Self {
        FecSender {
            encoder,
            ssrc,
            pt,
            seq_no: (fastrand::u16(..) as u64).into(),
        }
    }

    pub fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    /// Create the repair packets for a group of consecutive media packets.
    ///
    /// `media` holds the serialized packets in sequence number order,
    /// starting at `base_seq`.
    pub fn protect(
        &mut self,
        base_seq: u16,
        media: &[Vec<u8>],
        rtp_time: u32,
        now: Instant,
    ) -> Result<Vec<RtpPacket>, Error> {
        let k = media.len();
        if k == 0 {
            return Ok(vec![]);
        }

        let symbol_size = media.iter().map(|m| m.len() + 2).max().unwrap_or(2);
        if symbol_size > self.encoder.max_symbol_size() {
            return Err(Error::CapacityExceeded("media packet larger than FEC symbol"));
        }

        let sources = media
            .iter()
            .map(|m| to_source_symbol(m, symbol_size))
            .collect::<Option<Vec<_>>>()
            .ok_or(Error::CapacityExceeded("media packet larger than FEC symbol"))?;

        let symbols = self.encoder.encode_symbols(sources)?;
        let repair_count = symbols.len() - k;

        let packets: Vec<RtpPacket> = symbols
            .into_iter()
            .enumerate()
            .skip(k)
            .map(|(esi, symbol)| {
                let mut payload = Vec::with_capacity(REPAIR_HEADER_LEN + symbol.len());
                RepairHeader {
                    base_seq,
                    k: k as u16,
                    esi: esi as u16,
                }
                .write_to(&mut payload);
                payload.extend_from_slice(&symbol);

                let header = RtpHeader {
                    marker: esi == k + repair_count - 1,
                    payload_type: self.pt,
                    sequence_number: self.seq_no.as_u16(),
                    timestamp: rtp_time,
                    ssrc: self.ssrc,
                    ext_vals: ExtensionValues::with_abs_send_time(now),
                    ..Default::default()
                };
                self.seq_no = self.seq_no.next();

                RtpPacket {
                    header,
                    payload,
                    padding: 0,
                }
            })
            .collect();

        trace!(
            "FEC protect base_seq: {} k: {} repair: {} symbol size: {}",
            base_seq,
            k,
            packets.len(),
            symbol_size
        );

        Ok(packets)
    }
}

#[derive(Debug)]
struct Group {
    decoder: FecDecoder,
    created: Instant,
}

/// Recovers lost media packets from repair packets.
#[derive(Debug)]
pub struct FecReceiver {
    history: HashMap<u16, Vec<u8>>,
    /// Arrival order of `history`, oldest first.
    history_order: VecDeque<u16>,
    groups: HashMap<u16, Group>,
    done: VecDeque<u16>,
    timeout: Duration,
}

impl FecReceiver {
    pub fn new() -> Self {
        FecReceiver {
            history: HashMap::with_capacity(MEDIA_HISTORY),
            history_order: VecDeque::with_capacity(MEDIA_HISTORY),
            groups: HashMap::new(),
            done: VecDeque::with_capacity(DONE_HISTORY),
            timeout: GROUP_TIMEOUT,
        }
    }

    fn media(&self, seq: u16) -> Option<&[u8]> {
        self.history.get(&seq).map(|raw| raw.as_slice())
    }

    /// Record a received media packet.
    ///
    /// Returns media packets recovered thanks to it.
    pub fn on_media(&mut self, seq: u16, raw: &[u8]) -> Vec<Vec<u8>> {
        if self.media(seq).is_some() {
            return vec![];
        }

        if self.history_order.len() == MEDIA_HISTORY {
            if let Some(oldest) = self.history_order.pop_front() {
                self.history.remove(&oldest);
            }
        }
        self.history_order.push_back(seq);
        self.history.insert(seq, raw.to_vec());

        let mut recovered = vec![];
        let bases: Vec<u16> = self.groups.keys().copied().collect();

        for base in bases {
            let esi = seq.wrapping_sub(base) as usize;
            let Some(group) = self.groups.get_mut(&base) else {
                continue;
            };
            if esi >= group.decoder.k() {
                continue;
            }
            let Some(symbol) = to_source_symbol(raw, group.decoder.symbol_size()) else {
                continue;
            };
            if group.decoder.insert(esi, &symbol).is_ok() {
                recovered.extend(self.try_decode(base));
            }
        }

        recovered
    }

    /// Handle a packet from the repair stream.
    ///
    /// Returns the media packets the group was missing, if it could be decoded.
    pub fn on_repair(&mut self, packet: &RtpPacket, now: Instant) -> Result<Vec<Vec<u8>>, Error> {
        let header = RepairHeader::try_from(packet.payload.as_slice())?;
        let symbol = &packet.payload[REPAIR_HEADER_LEN..];

        if self.done.contains(&header.base_seq) {
            return Ok(vec![]);
        }

        let k = header.k as usize;
        let base = header.base_seq;

        if !self.groups.contains_key(&base) {
            // All sources already here, nothing to recover.
            let have_all = (0..header.k).all(|i| self.media(base.wrapping_add(i)).is_some());
            if have_all {
                self.mark_done(base);
                return Ok(vec![]);
            }

            let mut decoder = FecDecoder::new(k, symbol.len())?;
            for i in 0..header.k {
                let seq = base.wrapping_add(i);
                if let Some(s) = self
                    .media(seq)
                    .and_then(|raw| to_source_symbol(raw, symbol.len()))
                {
                    decoder.insert(i as usize, &s)?;
                }
            }

            debug!("FEC group created base_seq: {} k: {}", base, k);
            self.groups.insert(
                base,
                Group {
                    decoder,
                    created: now,
                },
            );
        }

        if let Some(group) = self.groups.get_mut(&base) {
            if group.decoder.k() != k {
                return Err(Error::Malformed("FEC repair k differs within group"));
            }
            group.decoder.insert(header.esi as usize, symbol)?;
        }

        Ok(self.try_decode(base))
    }

    fn try_decode(&mut self, base: u16) -> Vec<Vec<u8>> {
        let Some(group) = self.groups.get_mut(&base) else {
            return vec![];
        };

        let missing: Vec<usize> = (0..group.decoder.k())
            .filter(|i| !group.decoder.has_symbol(*i))
            .collect();

        let sources = match group.decoder.decode() {
            Ok(v) => v,
            Err(_) => return vec![],
        };

        self.groups.remove(&base);
        self.mark_done(base);

        let recovered: Vec<Vec<u8>> = missing
            .into_iter()
            .filter(|i| self.media(base.wrapping_add(*i as u16)).is_none())
            .filter_map(|i| sources.get(i))
            .filter_map(|s| from_source_symbol(s))
            .map(|raw| raw.to_vec())
            .collect();

        debug!(
            "FEC group decoded base_seq: {} recovered: {}",
            base,
            recovered.len()
        );

        recovered
    }

    fn mark_done(&mut self, base: u16) {
        if self.done.len() == DONE_HISTORY {
            self.done.pop_front();
        }
        self.done.push_back(base);
    }

    /// Abandon groups that did not get enough symbols in time.
    pub fn handle_timeout(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.groups.retain(|base, g| {
            let keep = now.saturating_duration_since(g.created) < timeout;
            if !keep {
                debug!(
                    "FEC group abandoned base_seq: {} received: {}/{}",
                    base,
                    g.decoder.received(),
                    g.decoder.k()
                );
            }
            keep
        });
    }

    /// When the oldest group times out.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.groups.values().map(|g| g.created + self.timeout).min()
    }

    /// Number of groups waiting for symbols.
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }
}

impl Default for FecReceiver {
    fn default() -> Self {
        Self::new()
    }
}
