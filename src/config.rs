use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::packet::Codec;
use crate::rtp::{Bitrate, DataSize, Extension, ExtensionMap, Pt};

/// Configuration of a media transport.
///
/// ```
/// use medialink::TransportConfig;
/// use medialink::rtp::Bitrate;
///
/// let config = TransportConfig::new()
///     .set_max_payload_size(1000)
///     .enable_fec(true);
///
/// assert_eq!(config.max_payload_size(), 1000);
/// assert!(config.fec().enabled());
/// ```
///
/// The config can be loaded with any serde format. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub(crate) max_payload_size: usize,
    pub(crate) exts: ExtensionMap,
    pub(crate) codecs: HashMap<Pt, Codec>,
    pub(crate) feedback: FeedbackConfig,
    pub(crate) bwe: BweConfig,
    pub(crate) fec: FecConfig,
}

impl TransportConfig {
    /// Creates a new default config.
    pub fn new() -> Self {
        TransportConfig::default()
    }

    /// Max size of the RTP payload, excluding the RTP header.
    ///
    /// Defaults to 1200.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    pub fn set_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// The RTP header extension mappings.
    pub fn extension_map(&self) -> &ExtensionMap {
        &self.exts
    }

    /// Set an extension mapping. The id must be 1-14 inclusive.
    pub fn set_extension(mut self, id: u8, ext: Extension) -> Self {
        self.exts.set(id, ext);
        self
    }

    /// Which codec a payload type carries.
    ///
    /// Defaults to 96 generic, 102 H264 and 45 AV1.
    pub fn codecs(&self) -> &HashMap<Pt, Codec> {
        &self.codecs
    }

    /// Map a payload type to a codec, replacing any earlier mapping.
    pub fn set_codec(mut self, pt: Pt, codec: Codec) -> Self {
        self.codecs.insert(pt, codec);
        self
    }

    /// Remove all payload type mappings.
    pub fn clear_codecs(mut self) -> Self {
        self.codecs.clear();
        self
    }

    pub fn feedback(&self) -> &FeedbackConfig {
        &self.feedback
    }

    pub fn set_feedback(mut self, feedback: FeedbackConfig) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn bwe(&self) -> &BweConfig {
        &self.bwe
    }

    pub fn set_bwe(mut self, bwe: BweConfig) -> Self {
        self.bwe = bwe;
        self
    }

    pub fn fec(&self) -> &FecConfig {
        &self.fec
    }

    pub fn set_fec(mut self, fec: FecConfig) -> Self {
        self.fec = fec;
        self
    }

    /// Toggle forward error correction on outgoing frames.
    ///
    /// Disabled by default.
    pub fn enable_fec(mut self, enabled: bool) -> Self {
        self.fec.enabled = enabled;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        let codecs = [
            (96.into(), Codec::Generic),
            (102.into(), Codec::H264),
            (45.into(), Codec::Av1),
        ]
        .into_iter()
        .collect();

        Self {
            max_payload_size: 1200,
            exts: ExtensionMap::standard(),
            codecs,
            feedback: FeedbackConfig::default(),
            bwe: BweConfig::default(),
            fec: FecConfig::default(),
        }
    }
}

/// Configuration of the receive side congestion control feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub(crate) min_interval: Duration,
    pub(crate) max_interval: Duration,
    pub(crate) max_marker_wait: Duration,
    pub(crate) feedback_fraction: f64,
    pub(crate) packet_overhead: DataSize,
}

impl FeedbackConfig {
    /// Shortest time between two feedback reports.
    ///
    /// Defaults to 25ms.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn set_min_interval(mut self, v: Duration) -> Self {
        self.min_interval = v;
        self
    }

    /// Longest time between two feedback reports when packets are arriving.
    ///
    /// Defaults to 250ms.
    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn set_max_interval(mut self, v: Duration) -> Self {
        self.max_interval = v;
        self
    }

    /// How long to wait for a marker bit after the first unreported arrival.
    ///
    /// Defaults to 25ms.
    pub fn max_marker_wait(&self) -> Duration {
        self.max_marker_wait
    }

    pub fn set_max_marker_wait(mut self, v: Duration) -> Self {
        self.max_marker_wait = v;
        self
    }

    /// Share of the send bitrate that may be spent on feedback.
    ///
    /// Defaults to 0.05.
    pub fn feedback_fraction(&self) -> f64 {
        self.feedback_fraction
    }

    pub fn set_feedback_fraction(mut self, v: f64) -> Self {
        self.feedback_fraction = v.clamp(0.0, 1.0);
        self
    }

    /// Bytes added to each feedback packet for the lower layers.
    ///
    /// Defaults to 28 (IPv4 and UDP headers).
    pub fn packet_overhead(&self) -> DataSize {
        self.packet_overhead
    }

    pub(crate) fn set_packet_overhead(&mut self, v: DataSize) {
        self.packet_overhead = v;
    }

    pub fn with_packet_overhead(mut self, v: DataSize) -> Self {
        self.packet_overhead = v;
        self
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(25),
            max_interval: Duration::from_millis(250),
            max_marker_wait: Duration::from_millis(25),
            feedback_fraction: 0.05,
            packet_overhead: DataSize::bytes(28),
        }
    }
}

/// Configuration of the send side bandwidth estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BweConfig {
    pub(crate) start_bitrate: Bitrate,
    pub(crate) min_bitrate: Bitrate,
    pub(crate) max_bitrate: Bitrate,
    pub(crate) loss_update_interval: Duration,
    pub(crate) probe_floor_fraction: f64,
    pub(crate) enable_loss_controller: bool,
    pub(crate) history_window: Duration,
}

impl BweConfig {
    /// The estimate before any feedback has arrived.
    ///
    /// Defaults to 300kbit/s.
    pub fn start_bitrate(&self) -> Bitrate {
        self.start_bitrate
    }

    pub fn set_start_bitrate(mut self, v: Bitrate) -> Self {
        self.start_bitrate = v;
        self
    }

    /// The estimate never goes below this.
    ///
    /// Defaults to 30kbit/s.
    pub fn min_bitrate(&self) -> Bitrate {
        self.min_bitrate
    }

    pub fn set_min_bitrate(mut self, v: Bitrate) -> Self {
        self.min_bitrate = v;
        self
    }

    /// The estimate never goes above this.
    ///
    /// Defaults to 20Mbit/s.
    pub fn max_bitrate(&self) -> Bitrate {
        self.max_bitrate
    }

    pub fn set_max_bitrate(mut self, v: Bitrate) -> Self {
        self.max_bitrate = v;
        self
    }

    /// How often loss counters are turned into a loss fraction.
    ///
    /// Defaults to 1000ms.
    pub fn loss_update_interval(&self) -> Duration {
        self.loss_update_interval
    }

    pub fn set_loss_update_interval(mut self, v: Duration) -> Self {
        self.loss_update_interval = v;
        self
    }

    /// Probe results are floored at this fraction of the acknowledged bitrate.
    ///
    /// Defaults to 0.85.
    pub fn probe_floor_fraction(&self) -> f64 {
        self.probe_floor_fraction
    }

    pub fn set_probe_floor_fraction(mut self, v: f64) -> Self {
        self.probe_floor_fraction = v;
        self
    }

    /// Whether loss limits the estimate.
    ///
    /// Enabled by default.
    pub fn loss_controller_enabled(&self) -> bool {
        self.enable_loss_controller
    }

    pub fn enable_loss_controller(mut self, enabled: bool) -> Self {
        self.enable_loss_controller = enabled;
        self
    }

    /// How long sent packets are kept waiting for feedback.
    ///
    /// Defaults to 60s.
    pub fn history_window(&self) -> Duration {
        self.history_window
    }

    pub fn set_history_window(mut self, v: Duration) -> Self {
        self.history_window = v;
        self
    }
}

impl Default for BweConfig {
    fn default() -> Self {
        Self {
            start_bitrate: Bitrate::kbps(300),
            min_bitrate: Bitrate::kbps(30),
            max_bitrate: Bitrate::mbps(20),
            loss_update_interval: Duration::from_millis(1000),
            probe_floor_fraction: 0.85,
            enable_loss_controller: true,
            history_window: Duration::from_secs(60),
        }
    }
}

/// Configuration of forward error correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FecConfig {
    pub(crate) enabled: bool,
    pub(crate) code_rate: f64,
    pub(crate) max_symbol_size: usize,
    pub(crate) payload_type: Pt,
}

impl FecConfig {
    /// Whether outgoing frames are protected.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Source symbols over total symbols. A rate of 0.5 doubles the packet count.
    ///
    /// Defaults to 0.8.
    pub fn code_rate(&self) -> f64 {
        self.code_rate
    }

    pub fn set_code_rate(mut self, v: f64) -> Self {
        self.code_rate = v;
        self
    }

    /// Largest symbol, which bounds the largest protected packet.
    ///
    /// Defaults to 1500.
    pub fn max_symbol_size(&self) -> usize {
        self.max_symbol_size
    }

    pub fn set_max_symbol_size(mut self, v: usize) -> Self {
        self.max_symbol_size = v;
        self
    }

    /// Payload type of the repair packets.
    ///
    /// Defaults to 127.
    pub fn payload_type(&self) -> Pt {
        self.payload_type
    }

    pub fn set_payload_type(mut self, pt: Pt) -> Self {
        self.payload_type = pt;
        self
    }
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            code_rate: 0.8,
            max_symbol_size: 1500,
            payload_type: 127.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serde_round_trip() {
        let config = TransportConfig::new()
            .set_max_payload_size(900)
            .set_codec(100.into(), Codec::H264)
            .set_bwe(BweConfig::default().set_start_bitrate(Bitrate::kbps(500)))
            .enable_fec(true);

        let json = serde_json::to_string(&config).unwrap();
        let back: TransportConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(back, config);
        assert_eq!(back.codecs().get(&100.into()), Some(&Codec::H264));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: TransportConfig =
            serde_json::from_str(r#"{ "max_payload_size": 500, "fec": { "enabled": true } }"#)
                .unwrap();

        assert_eq!(config.max_payload_size(), 500);
        assert!(config.fec().enabled());
        assert_eq!(config.fec().code_rate(), 0.8);
        assert_eq!(config.feedback(), &FeedbackConfig::default());
        assert_eq!(config.codecs().len(), 3);
    }

    #[test]
    fn feedback_fraction_is_clamped() {
        let c = FeedbackConfig::default().set_feedback_fraction(3.0);
        assert_eq!(c.feedback_fraction(), 1.0);
    }
}
