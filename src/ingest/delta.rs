//! Market event to volume delta conversion

use crate::config::DepthHeuristicConfig;
use crate::models::{DepthUpdate, MarketEvent, TradeEvent};

/// Buy and sell notional contributed by one event.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VolumeDelta {
    pub buy: f64,
    pub sell: f64,
}

impl VolumeDelta {
    pub fn is_zero(&self) -> bool {
        self.buy == 0.0 && self.sell == 0.0
    }

    pub fn is_valid(&self) -> bool {
        self.buy.is_finite() && self.sell.is_finite() && self.buy >= 0.0 && self.sell >= 0.0
    }
}

/// Whole trade notional goes to one side. A buyer-maker trade was initiated
/// by a selling taker.
#[inline]
pub fn trade_delta(trade: &TradeEvent) -> VolumeDelta {
    let notional = trade.price * trade.quantity;
    if trade.is_buyer_maker {
        VolumeDelta {
            buy: 0.0,
            sell: notional,
        }
    } else {
        VolumeDelta {
            buy: notional,
            sell: 0.0,
        }
    }
}

/// Heuristic volume from book depth: notional of the best `top_levels` on
/// each side, times `volume_scale`. Bids count as buy side, asks as sell.
///
/// This measures resting liquidity, not executed volume.
pub fn depth_delta(update: &DepthUpdate, config: &DepthHeuristicConfig) -> VolumeDelta {
    let side = |levels: &[(f64, f64)]| -> f64 {
        levels
            .iter()
            .take(config.top_levels)
            .filter(|(_, qty)| *qty > 0.0)
            .map(|(price, qty)| price * qty)
            .sum::<f64>()
            * config.volume_scale
    };

    VolumeDelta {
        buy: side(&update.bids),
        sell: side(&update.asks),
    }
}

pub fn event_delta(event: &MarketEvent, depth: &DepthHeuristicConfig) -> VolumeDelta {
    match event {
        MarketEvent::Trade(trade) => trade_delta(trade),
        MarketEvent::Depth(update) => depth_delta(update, depth),
    }
}
