//! Shared log-context prefix: `[SOL/USDT] [4y2xCN7r] [binance]`.
//!
//! Every engine and adapter line carries this prefix so that a worker host
//! running many strategies stays greppable by symbol, account and venue.

/// Build the `[SYMBOL] [API_KEY_PREFIX] [VENUE]` prefix.
///
/// Bare concatenated symbols (`SOLUSDT`) are rendered with a slash so the
/// prefix reads the same regardless of how the venue spells the pair.
pub fn make_log_prefix(symbol: &str, api_key: &str, venue_id: &str) -> String {
    let display_symbol = if symbol.contains('/') {
        symbol.to_string()
    } else {
        let upper = symbol.to_uppercase();
        match upper.strip_suffix("USDT") {
            Some(base) if !base.is_empty() => format!("{base}/USDT"),
            _ => upper,
        }
    };

    let key_prefix: String = api_key.chars().take(8).collect();
    format!("[{display_symbol}] [{key_prefix}] [{venue_id}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_symbols_pass_through() {
        assert_eq!(
            make_log_prefix("SOL/USDC", "4y2xCN7rabcdef", "backpack"),
            "[SOL/USDC] [4y2xCN7r] [backpack]"
        );
    }

    #[test]
    fn bare_usdt_symbols_gain_slash() {
        assert_eq!(
            make_log_prefix("solusdt", "k", "binance"),
            "[SOL/USDT] [k] [binance]"
        );
    }

    #[test]
    fn prediction_symbols_are_uppercased() {
        assert_eq!(
            make_log_prefix("btc-Up", "0xabcdef0123", "polymarket"),
            "[BTC-UP] [0xabcdef] [polymarket]"
        );
    }
}
