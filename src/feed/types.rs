use serde::{Deserialize, Serialize};

/// One decoded trade frame from the upstream feed.
///
/// Field names follow the upstream camelCase wire format; bonding-curve
/// fields are passed through untouched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    pub signature: String,
    pub mint: String,
    #[serde(rename = "traderPublicKey")]
    pub trader: String,
    pub tx_type: TxType,
    pub token_amount: f64,
    pub sol_amount: f64,
    /// The trader's token balance after this trade, in human units.
    pub new_token_balance: f64,
    /// Virtual bonding-curve valuation in SOL.
    pub market_cap_sol: f64,
    #[serde(default)]
    pub v_tokens_in_bonding_curve: Option<f64>,
    #[serde(default)]
    pub v_sol_in_bonding_curve: Option<f64>,
    #[serde(default)]
    pub pool: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Buy,
    Sell,
}

/// Outbound control frame: `{"method": "...", "keys": [...]}`.
#[derive(Debug, Clone, Serialize)]
pub struct ControlFrame {
    pub method: &'static str,
    pub keys: Vec<String>,
}

impl ControlFrame {
    pub fn subscribe(keys: Vec<String>) -> Self {
        Self {
            method: "subscribeTokenTrade",
            keys,
        }
    }

    pub fn unsubscribe(keys: Vec<String>) -> Self {
        Self {
            method: "unsubscribeTokenTrade",
            keys,
        }
    }
}

/// Connection state of the feed client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Point-in-time view of the client, returned by `status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedStatus {
    pub state: FeedState,
    /// Active subscription keys, unordered.
    pub subscriptions: Vec<String>,
    /// Set once reconnect attempts were exhausted; cleared by the next
    /// successful connect.
    pub failed: bool,
    /// Inbound frames dropped because they would not decode.
    pub frames_dropped: u64,
}

/// What one inbound text frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Trade(Box<TradeEvent>),
    /// Control-plane acknowledgement (no `mint` key); ignored.
    Control,
    Undecodable,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Self {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return InboundFrame::Undecodable;
        };
        if value.get("mint").and_then(|m| m.as_str()).is_none() {
            return InboundFrame::Control;
        }

        match serde_json::from_value::<TradeEvent>(value) {
            Ok(event) => InboundFrame::Trade(Box::new(event)),
            Err(_) => InboundFrame::Undecodable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRADE_FRAME: &str = r#"{
        "signature": "5vNz…sig",
        "mint": "7xKqmint",
        "traderPublicKey": "9aBtrader",
        "txType": "sell",
        "tokenAmount": 1500.5,
        "solAmount": 0.75,
        "newTokenBalance": 98500.0,
        "marketCapSol": 42.5,
        "vTokensInBondingCurve": 800000000.0,
        "vSolInBondingCurve": 34.2,
        "pool": "pump"
    }"#;

    #[test]
    fn decodes_a_trade_frame() {
        let InboundFrame::Trade(event) = InboundFrame::parse(TRADE_FRAME) else {
            panic!("expected a trade frame");
        };

        assert_eq!(event.mint, "7xKqmint");
        assert_eq!(event.trader, "9aBtrader");
        assert_eq!(event.tx_type, TxType::Sell);
        assert_eq!(event.new_token_balance, 98500.0);
        assert_eq!(event.market_cap_sol, 42.5);
        assert_eq!(event.pool.as_deref(), Some("pump"));
    }

    #[test]
    fn frames_without_a_mint_are_control_plane() {
        let ack = r#"{"message": "Successfully subscribed to keys."}"#;
        assert_eq!(InboundFrame::parse(ack), InboundFrame::Control);
    }

    #[test]
    fn garbage_and_partial_frames_are_undecodable() {
        assert_eq!(InboundFrame::parse("not json"), InboundFrame::Undecodable);
        // A mint alone is not enough to make a trade.
        assert_eq!(
            InboundFrame::parse(r#"{"mint": "7xKqmint"}"#),
            InboundFrame::Undecodable
        );
    }

    #[test]
    fn subscribe_frame_matches_the_upstream_shape() {
        let frame = ControlFrame::subscribe(vec!["M1".into(), "M2".into()]);
        let json = serde_json::to_value(&frame).expect("serialize");

        assert_eq!(
            json,
            serde_json::json!({"method": "subscribeTokenTrade", "keys": ["M1", "M2"]})
        );
    }

    #[test]
    fn bonding_curve_fields_are_optional() {
        let minimal = r#"{
            "signature": "s",
            "mint": "m",
            "traderPublicKey": "t",
            "txType": "buy",
            "tokenAmount": 1.0,
            "solAmount": 1.0,
            "newTokenBalance": 1.0,
            "marketCapSol": 1.0
        }"#;

        let InboundFrame::Trade(event) = InboundFrame::parse(minimal) else {
            panic!("expected a trade frame");
        };
        assert_eq!(event.v_tokens_in_bonding_curve, None);
        assert_eq!(event.pool, None);
    }
}
