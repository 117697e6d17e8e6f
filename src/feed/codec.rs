//! Market data message decoding
//!
//! Accepts both raw stream payloads and combined-stream envelopes
//! (`{"stream":"btcusdt@trade","data":{...}}`). Prices and quantities arrive
//! as decimal strings and are parsed with `fast_float`.

use simd_json::prelude::*;
use simd_json::BorrowedValue;
use thiserror::Error;

use crate::config::{DepthHeuristicConfig, StreamKind};
use crate::models::{now_ms, DepthUpdate, MarketEvent, TradeEvent};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("invalid json")]
    InvalidJson,
    #[error("payload is not an object")]
    NotObject,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("invalid number in field {0}")]
    InvalidNumber(&'static str),
    #[error("invalid price level")]
    InvalidLevel,
}

/// Decoder for one stream kind. Cheap to clone, shared by all symbol tasks.
#[derive(Debug, Clone)]
pub struct FeedCodec {
    kind: StreamKind,
    depth_levels: usize,
}

impl FeedCodec {
    pub fn new(kind: StreamKind, depth: &DepthHeuristicConfig) -> Self {
        Self {
            kind,
            depth_levels: depth.top_levels,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Stream name for `symbol` (`btcusdt@trade`, `btcusdt@depth10@100ms`).
    pub fn stream_name(&self, symbol: &str) -> String {
        let symbol = symbol.to_ascii_lowercase();
        match self.kind {
            StreamKind::Trade => format!("{}@trade", symbol),
            StreamKind::Depth => {
                // Partial book streams only exist for 5, 10 and 20 levels
                let levels = match self.depth_levels {
                    0..=5 => 5,
                    6..=10 => 10,
                    _ => 20,
                };
                format!("{}@depth{}@100ms", symbol, levels)
            }
        }
    }

    pub fn stream_url(&self, ws_base_url: &str, symbol: &str) -> String {
        format!(
            "{}/{}",
            ws_base_url.trim_end_matches('/'),
            self.stream_name(symbol)
        )
    }

    /// Decode one text frame received on `symbol`'s connection.
    ///
    /// `Ok(None)` is a control message (subscription ack and the like), not an
    /// error. The buffer is parsed in place.
    pub fn decode(&self, symbol: &str, raw: &mut [u8]) -> Result<Option<MarketEvent>, ParseError> {
        let value = simd_json::to_borrowed_value(raw).map_err(|_| ParseError::InvalidJson)?;
        let obj = value.as_object().ok_or(ParseError::NotObject)?;

        if obj.contains_key("result") || (obj.contains_key("id") && !obj.contains_key("data")) {
            return Ok(None);
        }

        let payload = match obj.get("data") {
            Some(data) => data,
            None => &value,
        };

        let event = match self.kind {
            StreamKind::Trade => MarketEvent::Trade(parse_trade(symbol, payload)?),
            StreamKind::Depth => MarketEvent::Depth(parse_depth(symbol, payload)?),
        };
        Ok(Some(event))
    }
}

fn parse_trade(symbol: &str, payload: &BorrowedValue) -> Result<TradeEvent, ParseError> {
    let obj = payload.as_object().ok_or(ParseError::NotObject)?;

    let price = parse_decimal(obj.get("p"), "p")?;
    let quantity = parse_decimal(obj.get("q"), "q")?;
    let is_buyer_maker = obj
        .get("m")
        .and_then(|v| v.as_bool())
        .ok_or(ParseError::MissingField("m"))?;

    // Trade time first, event time as fallback
    let event_time = obj
        .get("T")
        .and_then(|v| v.as_i64())
        .or_else(|| obj.get("E").and_then(|v| v.as_i64()))
        .ok_or(ParseError::MissingField("T"))?;
    if event_time < 0 {
        return Err(ParseError::InvalidNumber("T"));
    }

    Ok(TradeEvent {
        symbol: symbol.to_string(),
        event_time,
        price,
        quantity,
        is_buyer_maker,
    })
}

fn parse_depth(symbol: &str, payload: &BorrowedValue) -> Result<DepthUpdate, ParseError> {
    let obj = payload.as_object().ok_or(ParseError::NotObject)?;

    // Partial book snapshots use bids/asks; diff updates use b/a
    let bids = obj
        .get("bids")
        .or_else(|| obj.get("b"))
        .ok_or(ParseError::MissingField("bids"))?;
    let asks = obj
        .get("asks")
        .or_else(|| obj.get("a"))
        .ok_or(ParseError::MissingField("asks"))?;

    // Partial book snapshots carry no event time
    let event_time = obj
        .get("E")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(now_ms);
    if event_time < 0 {
        return Err(ParseError::InvalidNumber("E"));
    }

    Ok(DepthUpdate {
        symbol: symbol.to_string(),
        event_time,
        bids: parse_levels(bids)?,
        asks: parse_levels(asks)?,
    })
}

fn parse_levels(value: &BorrowedValue) -> Result<Vec<(f64, f64)>, ParseError> {
    let levels = value.as_array().ok_or(ParseError::InvalidLevel)?;
    let mut out = Vec::with_capacity(levels.len());
    for level in levels {
        let pair = level.as_array().ok_or(ParseError::InvalidLevel)?;
        if pair.len() < 2 {
            return Err(ParseError::InvalidLevel);
        }
        let price = parse_decimal(pair.first(), "price")?;
        let qty = parse_decimal(pair.get(1), "quantity")?;
        out.push((price, qty));
    }
    Ok(out)
}

/// Finite, non-negative decimal given as a string (or, leniently, a number).
#[inline]
fn parse_decimal(value: Option<&BorrowedValue>, field: &'static str) -> Result<f64, ParseError> {
    let value = value.ok_or(ParseError::MissingField(field))?;
    let parsed = match value.as_str() {
        Some(s) => fast_float::parse::<f64, _>(s).map_err(|_| ParseError::InvalidNumber(field))?,
        None => value.as_f64().ok_or(ParseError::InvalidNumber(field))?,
    };
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(ParseError::InvalidNumber(field));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade_codec() -> FeedCodec {
        FeedCodec::new(StreamKind::Trade, &DepthHeuristicConfig::default())
    }

    fn depth_codec() -> FeedCodec {
        FeedCodec::new(StreamKind::Depth, &DepthHeuristicConfig::default())
    }

    #[test]
    fn test_stream_names() {
        assert_eq!(trade_codec().stream_name("BTCUSDT"), "btcusdt@trade");
        assert_eq!(depth_codec().stream_name("ethusdt"), "ethusdt@depth10@100ms");
        assert_eq!(
            trade_codec().stream_url("wss://example.test/ws/", "btcusdt"),
            "wss://example.test/ws/btcusdt@trade"
        );
    }

    #[test]
    fn test_decode_raw_trade() {
        let mut raw = br#"{"e":"trade","E":1700000000123,"s":"BTCUSDT","t":1,"p":"43000.50","q":"0.002","T":1700000000120,"m":true}"#.to_vec();
        let event = trade_codec().decode("btcusdt", &mut raw).unwrap().unwrap();
        match event {
            MarketEvent::Trade(t) => {
                assert_eq!(t.symbol, "btcusdt");
                assert_eq!(t.event_time, 1700000000120);
                assert!((t.price - 43000.5).abs() < 1e-9);
                assert!((t.quantity - 0.002).abs() < 1e-12);
                assert!(t.is_buyer_maker);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_combined_trade() {
        let mut raw = br#"{"stream":"ethusdt@trade","data":{"e":"trade","E":5,"s":"ETHUSDT","p":"2000","q":"1.5","m":false}}"#.to_vec();
        let event = trade_codec().decode("ethusdt", &mut raw).unwrap().unwrap();
        assert_eq!(event.event_time(), 5);
        assert_eq!(event.symbol(), "ethusdt");
    }

    #[test]
    fn test_decode_depth_snapshot() {
        let mut raw = br#"{"lastUpdateId":160,"bids":[["100.0","2"],["99.5","1"]],"asks":[["100.5","3"]]}"#.to_vec();
        let event = depth_codec().decode("btcusdt", &mut raw).unwrap().unwrap();
        match event {
            MarketEvent::Depth(d) => {
                assert_eq!(d.bids, vec![(100.0, 2.0), (99.5, 1.0)]);
                assert_eq!(d.asks, vec![(100.5, 3.0)]);
                assert!(d.event_time > 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_depth_diff_update() {
        let mut raw = br#"{"e":"depthUpdate","E":42,"s":"BTCUSDT","b":[["1","1"]],"a":[]}"#.to_vec();
        let event = depth_codec().decode("btcusdt", &mut raw).unwrap().unwrap();
        assert_eq!(event.event_time(), 42);
    }

    #[test]
    fn test_control_message_is_not_an_event() {
        let mut raw = br#"{"result":null,"id":1}"#.to_vec();
        assert_eq!(trade_codec().decode("btcusdt", &mut raw), Ok(None));
    }

    #[test]
    fn test_malformed_messages() {
        let codec = trade_codec();
        let mut raw = b"not json".to_vec();
        assert_eq!(codec.decode("btcusdt", &mut raw), Err(ParseError::InvalidJson));

        let mut raw = br#"[1,2,3]"#.to_vec();
        assert_eq!(codec.decode("btcusdt", &mut raw), Err(ParseError::NotObject));

        let mut raw = br#"{"E":1,"p":"abc","q":"1","m":true}"#.to_vec();
        assert_eq!(codec.decode("btcusdt", &mut raw), Err(ParseError::InvalidNumber("p")));

        let mut raw = br#"{"E":1,"p":"-5","q":"1","m":true}"#.to_vec();
        assert_eq!(codec.decode("btcusdt", &mut raw), Err(ParseError::InvalidNumber("p")));

        let mut raw = br#"{"E":1,"p":"5","q":"1"}"#.to_vec();
        assert_eq!(codec.decode("btcusdt", &mut raw), Err(ParseError::MissingField("m")));

        // Exchange times are epoch milliseconds; a pre-epoch time is garbage
        let mut raw = br#"{"T":-9223372036854775808,"p":"5","q":"1","m":true}"#.to_vec();
        assert_eq!(codec.decode("btcusdt", &mut raw), Err(ParseError::InvalidNumber("T")));

        let mut raw = br#"{"E":-1,"b":[],"a":[]}"#.to_vec();
        assert_eq!(
            depth_codec().decode("btcusdt", &mut raw),
            Err(ParseError::InvalidNumber("E"))
        );

        let mut raw = br#"{"bids":[["1"]],"asks":[]}"#.to_vec();
        assert_eq!(
            depth_codec().decode("btcusdt", &mut raw),
            Err(ParseError::InvalidLevel)
        );
    }
}
