//! Concrete notification sinks behind the [`Notifier`] seam.
//!
//! * `TelegramNotifier` – HTML message through the Bot API
//! * `WebhookNotifier`  – signed JSON POST
//! * `LogNotifier`      – writes through `log`, used when nothing else is set

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::json;

use crate::{
    services::{
        dispatcher::{Notifier, Signal},
        strategies::Direction,
    },
    utils::{errors::DispatchError, signature::sign_payload},
};

/// Reasons listed in full before the rest is summarised.
const MAX_LISTED_REASONS: usize = 8;

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Telegram HTML body for one signal.
pub fn format_telegram_message(signal: &Signal) -> String {
    let arrow = match signal.direction {
        Direction::Buy => "🟢",
        Direction::Sell => "🔴",
    };
    let mut txt = format!(
        "🔔 <b>{}</b> SIGNAL: {arrow} <b>{}</b>\n",
        escape_html(&signal.instrument),
        signal.direction
    );
    txt += &format!("📊 <b>Score:</b> {}\n", signal.score);
    txt += &format!("💰 <b>Price:</b> {:.5}\n", signal.price);
    txt += &format!(
        "🕐 <b>Time:</b> {} UTC\n",
        signal.timestamp.format("%Y-%m-%d %H:%M:%S")
    );
    txt += &format!(
        "💵 <b>Payout:</b> {:.0}%{} · <b>Profit potential:</b> {:.2}\n",
        signal.payout_rate * 100.0,
        if signal.payout_degraded { " (fallback)" } else { "" },
        signal.profit_potential
    );

    if !signal.reasons.is_empty() {
        txt += "\n📈 <b>Analysis:</b>\n";
        for (i, r) in signal.reasons.iter().take(MAX_LISTED_REASONS).enumerate() {
            txt += &format!("{}. {}\n", i + 1, escape_html(r));
        }
        if signal.reasons.len() > MAX_LISTED_REASONS {
            txt += &format!("... and {} more\n", signal.reasons.len() - MAX_LISTED_REASONS);
        }
    }

    let ind = &signal.indicators;
    if ind.mtf_rsi.is_some() || ind.mtf_stochastic.is_some() {
        txt += &format!("\n🔍 <b>Key Indicators ({}):</b>\n", ind.mtf_timeframe);
        if let Some(rsi) = ind.mtf_rsi {
            txt += &format!("• RSI: {rsi:.1}\n");
        }
        if let Some(st) = ind.mtf_stochastic {
            txt += &format!("• Stochastic K/D: {:.1}/{:.1}\n", st.k, st.d);
        }
    }
    if let Some(trend) = ind.htf_trend {
        let label = match trend {
            Direction::Buy => "Bullish",
            Direction::Sell => "Bearish",
        };
        txt += &format!("📊 <b>Trend ({}):</b> {label}\n", ind.htf_timeframe);
    }
    txt
}

// --- Telegram --------------------------------------------------------

pub struct TelegramNotifier {
    http: Client,
    token: String,
    chat_id: String,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self::with_api_base(token, chat_id, "https://api.telegram.org")
    }

    /// Points the client at another Bot API host (self-hosted server, tests).
    pub fn with_api_base(
        token: impl Into<String>,
        chat_id: impl Into<String>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            http: Client::new(),
            token: token.into(),
            chat_id: chat_id.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn send_html(&self, text: &str) -> Result<(), DispatchError> {
        let resp = self
            .http
            .post(format!("{}/bot{}/sendMessage", self.api_base, self.token))
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }))
            .send()
            .await?;

        if resp.status() != StatusCode::OK {
            return Err(DispatchError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn deliver(&self, signal: &Signal) -> Result<(), DispatchError> {
        self.send_html(&format_telegram_message(signal)).await
    }

    async fn notify_text(&self, text: &str) -> Result<(), DispatchError> {
        self.send_html(text).await
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

// --- Webhook ---------------------------------------------------------

pub struct WebhookNotifier {
    http: Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
            secret,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, signal: &Signal) -> Result<(), DispatchError> {
        let body = serde_json::to_vec(signal)?;
        let mut req = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json");

        if let Some(secret) = &self.secret {
            let ts = Utc::now().timestamp().to_string();
            let sig = sign_payload(secret, &ts, &body);
            req = req
                .header("X-Signal-Timestamp", ts)
                .header("X-Signal-Signature", sig);
        }

        let resp = req.body(body).send().await?;
        if !resp.status().is_success() {
            return Err(DispatchError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

// --- Log -------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, signal: &Signal) -> Result<(), DispatchError> {
        log::info!("SIGNAL {}", serde_json::to_string(signal)?);
        Ok(())
    }

    async fn notify_text(&self, text: &str) -> Result<(), DispatchError> {
        log::info!("{text}");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{indicators::Stochastic, strategies::confluence::KeyIndicators};
    use chrono::DateTime;
    use uuid::Uuid;

    fn signal(reasons: usize) -> Signal {
        Signal {
            id: Uuid::nil(),
            instrument: "EURUSD-OTC".into(),
            direction: Direction::Buy,
            score: 85,
            price: 1.08421,
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            payout_rate: 0.82,
            profit_potential: 0.697,
            payout_degraded: false,
            reasons: (0..reasons).map(|i| format!("MTF RSI {i} <30 +20")).collect(),
            indicators: KeyIndicators::default(),
        }
    }

    #[test]
    fn message_lists_eight_reasons_then_summarises() {
        let txt = format_telegram_message(&signal(11));
        assert!(txt.contains("<b>EURUSD-OTC</b>"));
        assert!(txt.contains("<b>BUY</b>"));
        assert!(txt.contains("8. MTF RSI 7 &lt;30 +20"));
        assert!(!txt.contains("9. "));
        assert!(txt.contains("... and 3 more"));
        assert!(txt.contains("2023-11-14 22:13:20 UTC"));
        assert!(txt.contains("82%"));
    }

    #[test]
    fn short_reason_list_has_no_summary() {
        let txt = format_telegram_message(&signal(2));
        assert!(txt.contains("2. "));
        assert!(!txt.contains("more"));
    }

    #[test]
    fn message_carries_mtf_readings_and_htf_trend() {
        let mut sig = signal(1);
        sig.indicators = KeyIndicators {
            mtf_timeframe: "5m".into(),
            mtf_rsi: Some(24.36),
            mtf_stochastic: Some(Stochastic { k: 12.04, d: 18.5 }),
            htf_timeframe: "15m".into(),
            htf_trend: Some(Direction::Sell),
        };
        let txt = format_telegram_message(&sig);
        assert!(txt.contains("Key Indicators (5m)"));
        assert!(txt.contains("• RSI: 24.4"));
        assert!(txt.contains("• Stochastic K/D: 12.0/18.5"));
        assert!(txt.contains("<b>Trend (15m):</b> Bearish"));

        // nothing warmed up: neither block appears
        let bare = format_telegram_message(&signal(1));
        assert!(!bare.contains("Key Indicators"));
        assert!(!bare.contains("Trend"));
    }

    #[tokio::test]
    async fn log_notifier_always_accepts() {
        assert!(LogNotifier.deliver(&signal(1)).await.is_ok());
        assert_eq!(LogNotifier.name(), "log");
    }
}
