//! Request rate limits for translation backends, written as `10/s` or `60/m`.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::{prelude::*, toml_utils::custom_deser_error};

/// The period a [`RateLimit`] is measured over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    Second,
    Minute,
}

impl RateLimitPeriod {
    /// The length of this period.
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A maximum number of requests per period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimit {
    pub max_requests: usize,
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Build a [`RateLimiter`] enforcing this limit.
    ///
    /// The bucket starts full and refills one token at a time, spread evenly
    /// over the period, so a long translation run settles into a steady pace
    /// instead of bursting at the top of every minute.
    pub fn to_rate_limiter(&self) -> RateLimiter {
        let max = self.max_requests.max(1);
        let interval = self.per_period.to_duration() / max as u32;
        RateLimiter::builder()
            .initial(max)
            .refill(1)
            .max(max)
            .interval(interval.max(Duration::from_millis(1)))
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let (count, period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("expected COUNT/PERIOD"))?;
            let max_requests = count.trim().parse::<usize>()?;
            if max_requests == 0 {
                return Err(anyhow!("rate limit must allow at least one request"));
            }
            Ok(Self {
                max_requests,
                per_period: period.trim().parse()?,
            })
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}

impl<'de> toml_span::Deserialize<'de> for RateLimit {
    fn deserialize(
        value: &mut toml_span::Value<'de>,
    ) -> Result<Self, toml_span::DeserError> {
        let span = value.span;
        let s = value.take_string(None)?;
        s.parse()
            .map_err(|err: anyhow::Error| custom_deser_error(span, format!("{err:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_displays() {
        let rate_limit = RateLimit::from_str("10/s").unwrap();
        assert_eq!(rate_limit.max_requests, 10);
        assert_eq!(rate_limit.per_period, RateLimitPeriod::Second);
        assert_eq!(rate_limit.to_string(), "10/s");

        let rate_limit = RateLimit::from_str("60/m").unwrap();
        assert_eq!(rate_limit.per_period, RateLimitPeriod::Minute);
        assert_eq!(rate_limit.to_string(), "60/m");
    }

    #[test]
    fn rejects_bad_limits() {
        assert!(RateLimit::from_str("10/h").is_err());
        assert!(RateLimit::from_str("ten/s").is_err());
        assert!(RateLimit::from_str("0/s").is_err());
        assert!(RateLimit::from_str("10").is_err());
    }

    #[tokio::test]
    async fn limiter_allows_an_initial_burst() {
        let limiter = RateLimit::from_str("3/m").unwrap().to_rate_limiter();
        for _ in 0..3 {
            assert!(limiter.try_acquire(1));
        }
        assert!(!limiter.try_acquire(1));
    }
}
