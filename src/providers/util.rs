use crate::core::error::SourceError;
use reqwest::{Response, StatusCode};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::time::Duration;

pub const USER_AGENT: &str = "solbasket/0.1";

/// Builds the HTTP client shared by a provider. The client timeout backs up the
/// chain's own per-call timeout.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, SourceError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| SourceError::Transport(e.to_string()))
}

/// Maps a 429 to `RateLimited` and any other non-2xx to `HttpStatus`.
pub fn check_status(response: Response) -> Result<Response, SourceError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(SourceError::RateLimited);
    }
    if !status.is_success() {
        return Err(SourceError::HttpStatus(status.as_u16()));
    }
    Ok(response)
}

/// Converts a wire price into a positive decimal.
pub fn positive_price(asset: &str, price: f64) -> Result<Decimal, SourceError> {
    match Decimal::from_f64(price) {
        Some(value) if value > Decimal::ZERO => Ok(value),
        _ => Err(SourceError::InvalidPrice {
            asset: asset.to_string(),
            price: price.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_positive_price() {
        assert_eq!(positive_price("SOL", 182.25).unwrap(), dec!(182.25));
        assert!(matches!(
            positive_price("SOL", 0.0),
            Err(SourceError::InvalidPrice { .. })
        ));
        assert!(positive_price("SOL", -1.0).is_err());
        assert!(positive_price("SOL", f64::NAN).is_err());
    }
}
