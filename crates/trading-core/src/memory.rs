//! In-process implementations of the persistence and alert seams.
//!
//! Used when no database is configured and throughout the test suites.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::traits::{AlertSink, TradingStore};
use crate::types::*;

#[derive(Default)]
struct Inner {
    signals: Vec<Signal>,
    executions: Vec<Execution>,
    risk: Vec<RiskMetrics>,
    alerts: Vec<Alert>,
    scans: Vec<ScanOutcome>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.inner.lock().await.alerts.clone()
    }

    pub async fn scans(&self) -> Vec<ScanOutcome> {
        self.inner.lock().await.scans.clone()
    }

    pub async fn executions(&self) -> Vec<Execution> {
        self.inner.lock().await.executions.clone()
    }
}

#[async_trait]
impl TradingStore for MemoryStore {
    async fn insert_signal(&self, signal: &Signal) -> StoreResult<i64> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id();
        let mut stored = signal.clone();
        stored.id = Some(id);
        inner.signals.push(stored);
        Ok(id)
    }

    async fn get_signal(&self, id: i64) -> StoreResult<Option<Signal>> {
        let inner = self.inner.lock().await;
        Ok(inner.signals.iter().find(|s| s.id == Some(id)).cloned())
    }

    async fn pending_signals(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<Signal>> {
        let inner = self.inner.lock().await;
        let mut pending: Vec<Signal> = inner
            .signals
            .iter()
            .filter(|s| s.status == SignalStatus::Pending && !s.is_expired(now))
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn transition_signal(
        &self,
        id: i64,
        from: SignalStatus,
        to: SignalStatus,
        reason: Option<&str>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().await;
        let signal = match inner.signals.iter_mut().find(|s| s.id == Some(id)) {
            Some(signal) if signal.status == from => signal,
            _ => return Ok(false),
        };
        signal.status = to;
        if let Some(reason) = reason {
            signal.status_reason = Some(reason.to_string());
        }
        Ok(true)
    }

    async fn expire_signals(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().await;
        let mut expired = 0;
        for signal in inner.signals.iter_mut() {
            if signal.status == SignalStatus::Pending && signal.is_expired(now) {
                signal.status = SignalStatus::Expired;
                signal.status_reason = Some("TTL elapsed".to_string());
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn signals_expired_in(
        &self,
        status: SignalStatus,
        expired_by: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<Signal>> {
        let inner = self.inner.lock().await;
        let mut stale: Vec<Signal> = inner
            .signals
            .iter()
            .filter(|s| s.status == status && s.expires_at <= expired_by)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn insert_execution(&self, execution: &Execution) -> StoreResult<i64> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id();
        let mut stored = execution.clone();
        stored.id = Some(id);
        inner.executions.push(stored);
        Ok(id)
    }

    async fn open_executions(&self) -> StoreResult<Vec<Execution>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .executions
            .iter()
            .filter(|e| e.status.is_live())
            .cloned()
            .collect())
    }

    async fn execution_for_signal(&self, signal_id: i64) -> StoreResult<Option<Execution>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .executions
            .iter()
            .rev()
            .find(|e| e.signal_id == Some(signal_id))
            .cloned())
    }

    async fn open_execution_for(
        &self,
        symbol: &str,
        direction: Direction,
    ) -> StoreResult<Option<Execution>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .executions
            .iter()
            .rev()
            .find(|e| e.status.is_live() && e.symbol == symbol && e.direction == direction)
            .cloned())
    }

    async fn update_excursion(
        &self,
        id: i64,
        excursion: &Excursion,
        unrealized_pnl: f64,
        stop_loss: Option<f64>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let execution = inner
            .executions
            .iter_mut()
            .find(|e| e.id == Some(id))
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", id)))?;
        execution.excursion = *excursion;
        execution.unrealized_pnl = unrealized_pnl;
        if stop_loss.is_some() {
            execution.stop_loss = stop_loss;
        }
        Ok(())
    }

    async fn close_execution(&self, id: i64, close: &ExecutionClose) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let execution = inner
            .executions
            .iter_mut()
            .find(|e| e.id == Some(id))
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", id)))?;
        execution.status = close.status;
        execution.exit_price = Some(close.exit_price);
        execution.realized_pnl = Some(close.realized_pnl);
        execution.trading_fees = close.trading_fees;
        execution.closed_at = Some(close.closed_at);
        execution.excursion = close.excursion;
        execution.unrealized_pnl = 0.0;
        execution.close_reason = Some(close.close_reason.clone());
        Ok(())
    }

    async fn recent_closed_executions(&self, limit: usize) -> StoreResult<Vec<Execution>> {
        let inner = self.inner.lock().await;
        let mut closed: Vec<Execution> = inner
            .executions
            .iter()
            .filter(|e| e.closed_at.is_some() && e.status.is_settled())
            .cloned()
            .collect();
        closed.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        closed.truncate(limit);
        Ok(closed)
    }

    async fn closed_executions_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Execution>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .executions
            .iter()
            .filter(|e| e.status.is_settled() && e.closed_at.map(|t| t >= since).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn risk_metrics_for(&self, date: NaiveDate) -> StoreResult<Option<RiskMetrics>> {
        let inner = self.inner.lock().await;
        Ok(inner.risk.iter().find(|m| m.date == date).cloned())
    }

    async fn latest_risk_metrics(&self, date: NaiveDate) -> StoreResult<Option<RiskMetrics>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .risk
            .iter()
            .filter(|m| m.date <= date)
            .max_by_key(|m| m.date)
            .cloned())
    }

    async fn upsert_risk_metrics(&self, metrics: &RiskMetrics) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.risk.iter_mut().find(|m| m.date == metrics.date) {
            Some(existing) => *existing = metrics.clone(),
            None => inner.risk.push(metrics.clone()),
        }
        Ok(())
    }

    async fn insert_alert(&self, alert: &Alert) -> StoreResult<i64> {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id();
        inner.alerts.push(alert.clone());
        Ok(id)
    }

    async fn record_scan(&self, outcome: &ScanOutcome) -> StoreResult<()> {
        self.inner.lock().await.scans.push(outcome.clone());
        Ok(())
    }
}

/// Alert sink that only writes a tracing line
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn emit(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Info => {
                tracing::info!("[{}] {}: {}", alert.kind.as_str(), alert.title, alert.message)
            }
            AlertSeverity::Warning => {
                tracing::warn!("[{}] {}: {}", alert.kind.as_str(), alert.title, alert.message)
            }
            AlertSeverity::Critical | AlertSeverity::Emergency => {
                tracing::error!("[{}] {}: {}", alert.kind.as_str(), alert.title, alert.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn signal(symbol: &str, created_at: DateTime<Utc>) -> Signal {
        Signal {
            id: None,
            symbol: symbol.to_string(),
            direction: Direction::Long,
            confidence: 82.0,
            strength: 85.0,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profits: [103.0, 105.0, 108.0],
            risk_reward: 1.5,
            position_size_usd: 50.0,
            leverage: 10,
            layers: Vec::new(),
            tier: "top10".to_string(),
            created_at,
            expires_at: created_at + Duration::minutes(5),
            status: SignalStatus::Pending,
            status_reason: None,
        }
    }

    #[tokio::test]
    async fn claim_succeeds_once() {
        let store = MemoryStore::new();
        let id = store.insert_signal(&signal("BTCUSDT", Utc::now())).await.unwrap();

        let first = store
            .transition_signal(id, SignalStatus::Pending, SignalStatus::Approved, None)
            .await
            .unwrap();
        let second = store
            .transition_signal(id, SignalStatus::Pending, SignalStatus::Approved, None)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn pending_is_newest_first_and_skips_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_signal(&signal("OLD", now - Duration::minutes(10))).await.unwrap();
        store.insert_signal(&signal("A", now - Duration::minutes(2))).await.unwrap();
        store.insert_signal(&signal("B", now - Duration::minutes(1))).await.unwrap();

        let pending = store.pending_signals(now, 10).await.unwrap();
        let symbols: Vec<&str> = pending.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["B", "A"]);

        assert_eq!(store.expire_signals(now).await.unwrap(), 1);
        assert_eq!(store.expire_signals(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_lookup_is_per_status_and_oldest_first() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let newer = store.insert_signal(&signal("NEWER", now - Duration::minutes(7))).await.unwrap();
        let older = store.insert_signal(&signal("OLDER", now - Duration::minutes(9))).await.unwrap();
        store.insert_signal(&signal("LIVE", now)).await.unwrap();
        for id in [newer, older] {
            store
                .transition_signal(id, SignalStatus::Pending, SignalStatus::Approved, None)
                .await
                .unwrap();
        }

        let stale = store
            .signals_expired_in(SignalStatus::Approved, now, 10)
            .await
            .unwrap();
        let ids: Vec<Option<i64>> = stale.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![Some(older), Some(newer)]);
        assert!(store
            .signals_expired_in(SignalStatus::Pending, now, 10)
            .await
            .unwrap()
            .is_empty());
        assert!(store.execution_for_signal(older).await.unwrap().is_none());
    }
}
