#[cfg(test)]
mod trading_agent_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use exchange_client::{LiquidationEvent, LiquidationTracker};
    use kelly_position_sizer::KellyPositionSizer;
    use tokio_util::sync::CancellationToken;
    use trading_core::*;

    use crate::config::TierConfig;
    use crate::market_filter::MarketFilter;
    use crate::market_scanner::{ScannerScheduler, TierScanner};
    use crate::position_manager::PositionManager;
    use crate::scorers::{LayerScores, LiquidationScorer, ScorerSet};
    use crate::signal_generator::{resolve_direction, signal_strength, AccountState, SignalGenerator};
    use crate::trade_executor::{split_quantity, ExecutionOutcome, ExecutorSettings, TradeExecutor};

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    struct MockExchange {
        price: f64,
        equity: f64,
        /// Highest leverage `set_leverage` accepts
        max_leverage: u32,
        closes: Mutex<Vec<f64>>,
        positions: Mutex<Vec<ExchangePosition>>,
        closed_pnl: Mutex<Vec<ClosedPnl>>,
        leverage_attempts: Mutex<Vec<u32>>,
        /// Returned by `set_leverage` instead of the limit check when set
        leverage_error: Mutex<Option<ExchangeError>>,
        orders: Mutex<Vec<OrderRequest>>,
        stops: Mutex<Vec<TradingStopRequest>>,
        cancels: AtomicUsize,
    }

    impl MockExchange {
        fn new(max_leverage: u32) -> Arc<Self> {
            Arc::new(Self {
                price: 100.0,
                equity: 10_000.0,
                max_leverage,
                closes: Mutex::new(Vec::new()),
                positions: Mutex::new(Vec::new()),
                closed_pnl: Mutex::new(Vec::new()),
                leverage_attempts: Mutex::new(Vec::new()),
                leverage_error: Mutex::new(None),
                orders: Mutex::new(Vec::new()),
                stops: Mutex::new(Vec::new()),
                cancels: AtomicUsize::new(0),
            })
        }

        fn set_positions(&self, positions: Vec<ExchangePosition>) {
            *self.positions.lock().unwrap() = positions;
        }

        fn orders(&self) -> Vec<OrderRequest> {
            self.orders.lock().unwrap().clone()
        }
    }

    fn position(symbol: &str, side: OrderSide, size: f64, mark: f64) -> ExchangePosition {
        ExchangePosition {
            symbol: symbol.to_string(),
            side,
            size,
            entry_price: 100.0,
            mark_price: mark,
            leverage: 10.0,
            unrealized_pnl: (mark - 100.0) * size,
            position_idx: if side == OrderSide::Buy { 1 } else { 2 },
            stop_loss: None,
            take_profit: None,
            trailing_stop: None,
        }
    }

    #[async_trait]
    impl Exchange for MockExchange {
        async fn get_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
            if symbol.starts_with("BAD") {
                return Err(ExchangeError::Api {
                    code: 10001,
                    msg: "symbol invalid".to_string(),
                });
            }
            Ok(Ticker {
                symbol: symbol.to_string(),
                last_price: self.price,
                mark_price: self.price,
                bid: self.price - 0.01,
                ask: self.price + 0.01,
                volume_24h: 1_000_000.0,
                turnover_24h: 100_000_000.0,
                price_change_24h_percent: 1.2,
                funding_rate: Some(0.0001),
            })
        }

        async fn get_klines(&self, _: &str, _: &str, _: u32) -> ExchangeResult<Vec<Candle>> {
            let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
            Ok(self
                .closes
                .lock()
                .unwrap()
                .iter()
                .enumerate()
                .map(|(i, close)| Candle {
                    open_time: start + chrono::Duration::hours(i as i64),
                    open: *close,
                    high: *close,
                    low: *close,
                    close: *close,
                    volume: 10.0,
                })
                .collect())
        }

        async fn get_orderbook(&self, symbol: &str, _: u32) -> ExchangeResult<OrderBook> {
            Ok(OrderBook {
                symbol: symbol.to_string(),
                bids: Vec::new(),
                asks: Vec::new(),
            })
        }

        async fn get_instrument(&self, symbol: &str) -> ExchangeResult<InstrumentInfo> {
            Ok(InstrumentInfo {
                symbol: symbol.to_string(),
                qty_step: 0.001,
                min_order_qty: 0.001,
                max_leverage: self.max_leverage as f64,
                tick_size: 0.01,
            })
        }

        async fn set_leverage(&self, _: &str, leverage: u32) -> ExchangeResult<()> {
            self.leverage_attempts.lock().unwrap().push(leverage);
            if let Some(e) = self.leverage_error.lock().unwrap().clone() {
                return Err(e);
            }
            if leverage > self.max_leverage {
                return Err(ExchangeError::Api {
                    code: 110013,
                    msg: "cannot set leverage above the risk limit".to_string(),
                });
            }
            Ok(())
        }

        async fn place_order(&self, order: &OrderRequest) -> ExchangeResult<OrderAck> {
            let mut orders = self.orders.lock().unwrap();
            orders.push(order.clone());
            Ok(OrderAck {
                order_id: format!("order-{}", orders.len()),
                order_link_id: None,
            })
        }

        async fn get_positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<ExchangePosition>> {
            Ok(self
                .positions
                .lock()
                .unwrap()
                .iter()
                .filter(|p| symbol.map(|s| p.symbol == s).unwrap_or(true))
                .cloned()
                .collect())
        }

        async fn get_wallet_balance(&self) -> ExchangeResult<WalletBalance> {
            Ok(WalletBalance {
                total_equity: self.equity,
                available_balance: self.equity,
                unrealized_pnl: 0.0,
            })
        }

        async fn set_trading_stop(&self, request: &TradingStopRequest) -> ExchangeResult<()> {
            self.stops.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn cancel_all_orders(&self, _: Option<&str>) -> ExchangeResult<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_closed_pnl(&self, _: Option<&str>, _: u32) -> ExchangeResult<Vec<ClosedPnl>> {
            Ok(self.closed_pnl.lock().unwrap().clone())
        }

        fn credentials_degraded(&self) -> bool {
            false
        }

        fn position_idx(&self, direction: Direction) -> u8 {
            match direction {
                Direction::Long => 1,
                Direction::Short => 2,
            }
        }
    }

    struct FixedScorer {
        layer: Layer,
        reading: LayerReading,
    }

    #[async_trait]
    impl LayerScorer for FixedScorer {
        fn layer(&self) -> Layer {
            self.layer
        }

        async fn score(&self, _symbol: &str) -> anyhow::Result<LayerReading> {
            Ok(self.reading.clone())
        }
    }

    /// MemoryStore with switchable write failures
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_execution_inserts: AtomicUsize,
        fail_executed_transitions: AtomicUsize,
        fail_closes: AtomicUsize,
    }

    impl FlakyStore {
        fn failing(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn outage() -> StoreError {
            StoreError::Database("database is locked".to_string())
        }
    }

    #[async_trait]
    impl TradingStore for FlakyStore {
        async fn insert_signal(&self, signal: &Signal) -> StoreResult<i64> {
            self.inner.insert_signal(signal).await
        }

        async fn get_signal(&self, id: i64) -> StoreResult<Option<Signal>> {
            self.inner.get_signal(id).await
        }

        async fn pending_signals(
            &self,
            now: chrono::DateTime<Utc>,
            limit: usize,
        ) -> StoreResult<Vec<Signal>> {
            self.inner.pending_signals(now, limit).await
        }

        async fn transition_signal(
            &self,
            id: i64,
            from: SignalStatus,
            to: SignalStatus,
            reason: Option<&str>,
        ) -> StoreResult<bool> {
            if to == SignalStatus::Executed && Self::failing(&self.fail_executed_transitions) {
                return Err(Self::outage());
            }
            self.inner.transition_signal(id, from, to, reason).await
        }

        async fn expire_signals(&self, now: chrono::DateTime<Utc>) -> StoreResult<u64> {
            self.inner.expire_signals(now).await
        }

        async fn signals_expired_in(
            &self,
            status: SignalStatus,
            expired_by: chrono::DateTime<Utc>,
            limit: usize,
        ) -> StoreResult<Vec<Signal>> {
            self.inner.signals_expired_in(status, expired_by, limit).await
        }

        async fn insert_execution(&self, execution: &Execution) -> StoreResult<i64> {
            if Self::failing(&self.fail_execution_inserts) {
                return Err(Self::outage());
            }
            self.inner.insert_execution(execution).await
        }

        async fn open_executions(&self) -> StoreResult<Vec<Execution>> {
            self.inner.open_executions().await
        }

        async fn execution_for_signal(&self, signal_id: i64) -> StoreResult<Option<Execution>> {
            self.inner.execution_for_signal(signal_id).await
        }

        async fn open_execution_for(
            &self,
            symbol: &str,
            direction: Direction,
        ) -> StoreResult<Option<Execution>> {
            self.inner.open_execution_for(symbol, direction).await
        }

        async fn update_excursion(
            &self,
            id: i64,
            excursion: &Excursion,
            unrealized_pnl: f64,
            stop_loss: Option<f64>,
        ) -> StoreResult<()> {
            self.inner
                .update_excursion(id, excursion, unrealized_pnl, stop_loss)
                .await
        }

        async fn close_execution(&self, id: i64, close: &ExecutionClose) -> StoreResult<()> {
            if Self::failing(&self.fail_closes) {
                return Err(Self::outage());
            }
            self.inner.close_execution(id, close).await
        }

        async fn recent_closed_executions(&self, limit: usize) -> StoreResult<Vec<Execution>> {
            self.inner.recent_closed_executions(limit).await
        }

        async fn closed_executions_since(
            &self,
            since: chrono::DateTime<Utc>,
        ) -> StoreResult<Vec<Execution>> {
            self.inner.closed_executions_since(since).await
        }

        async fn risk_metrics_for(
            &self,
            date: chrono::NaiveDate,
        ) -> StoreResult<Option<RiskMetrics>> {
            self.inner.risk_metrics_for(date).await
        }

        async fn latest_risk_metrics(
            &self,
            date: chrono::NaiveDate,
        ) -> StoreResult<Option<RiskMetrics>> {
            self.inner.latest_risk_metrics(date).await
        }

        async fn upsert_risk_metrics(&self, metrics: &RiskMetrics) -> StoreResult<()> {
            self.inner.upsert_risk_metrics(metrics).await
        }

        async fn insert_alert(&self, alert: &Alert) -> StoreResult<i64> {
            self.inner.insert_alert(alert).await
        }

        async fn record_scan(&self, outcome: &ScanOutcome) -> StoreResult<()> {
            self.inner.record_scan(outcome).await
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<Alert>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn emit(&self, alert: Alert) {
            self.alerts.lock().unwrap().push(alert);
        }
    }

    struct FixedGate {
        allow: bool,
        seen: Mutex<Vec<f64>>,
    }

    impl FixedGate {
        fn new(allow: bool) -> Arc<Self> {
            Arc::new(Self {
                allow,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TradeGate for FixedGate {
        async fn can_trade(&self, proposed_size_percent: f64) -> anyhow::Result<RiskCheck> {
            self.seen.lock().unwrap().push(proposed_size_percent);
            Ok(if self.allow {
                RiskCheck::allowed(Vec::new())
            } else {
                RiskCheck::denied("Daily loss limit reached")
            })
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn scores_leaning(direction: Direction) -> LayerScores {
        let against = match direction {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        };
        [
            (Layer::Technical, 90.0, direction),
            (Layer::OrderFlow, 80.0, direction),
            // The other side is being flushed
            (Layer::Liquidation, 70.0, against),
            (Layer::Sentiment, 70.0, direction),
            (Layer::Ml, 85.0, direction),
            (Layer::Timing, 70.0, direction),
        ]
        .into_iter()
        .map(|(layer, score, lean)| (layer, LayerReading::new(score, "test").leaning(lean)))
        .collect()
    }

    fn bullish_scores() -> LayerScores {
        scores_leaning(Direction::Long)
    }

    fn scorers_for(scores: LayerScores) -> ScorerSet {
        ScorerSet::new(
            scores
                .into_iter()
                .map(|(layer, reading)| {
                    Arc::new(FixedScorer { layer, reading }) as Arc<dyn LayerScorer>
                })
                .collect(),
        )
    }

    fn bullish_scorers() -> ScorerSet {
        scorers_for(bullish_scores())
    }

    fn tier(threshold: f64, symbols: &[&str]) -> TierConfig {
        TierConfig {
            name: "top10".to_string(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            interval: Duration::from_secs(60),
            threshold,
        }
    }

    fn account() -> AccountState {
        AccountState {
            balance: 10_000.0,
            current_exposure_usd: 0.0,
            max_leverage: None,
        }
    }

    fn generator(store: Arc<MemoryStore>) -> Arc<SignalGenerator> {
        generator_with(store, KellyPositionSizer::default())
    }

    fn generator_with(store: Arc<MemoryStore>, sizer: KellyPositionSizer) -> Arc<SignalGenerator> {
        Arc::new(
            SignalGenerator::new(
                store,
                Arc::new(LogAlertSink),
                sizer,
                Layer::ALL.iter().map(|l| (*l, l.default_weight())).collect(),
                Duration::from_secs(300),
            )
            .unwrap(),
        )
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            leverage_ladder: vec![100, 75, 50, 25, 20, 15, 10, 5, 3, 2, 1],
            trailing_distance_percent: 1.5,
            trailing_activation_percent: 2.0,
            partial_take_profits: true,
        }
    }

    fn executor(
        exchange: Arc<MockExchange>,
        store: Arc<dyn TradingStore>,
        gate: Arc<FixedGate>,
        filter_enabled: bool,
    ) -> TradeExecutor {
        executor_alerting(exchange, store, gate, filter_enabled, Arc::new(LogAlertSink))
    }

    fn executor_alerting(
        exchange: Arc<MockExchange>,
        store: Arc<dyn TradingStore>,
        gate: Arc<FixedGate>,
        filter_enabled: bool,
        alerts: Arc<dyn AlertSink>,
    ) -> TradeExecutor {
        TradeExecutor::new(
            exchange.clone(),
            store,
            gate,
            MarketFilter::new(exchange, filter_enabled),
            alerts,
            settings(),
        )
    }

    async fn insert_pending(
        store: &MemoryStore,
        symbol: &str,
        leverage: u32,
        created_at: chrono::DateTime<Utc>,
    ) -> Signal {
        insert_directed(store, symbol, Direction::Long, leverage, created_at).await
    }

    /// Pending $100 signal entered at 100 with a 2% stop
    async fn insert_directed(
        store: &MemoryStore,
        symbol: &str,
        direction: Direction,
        leverage: u32,
        created_at: chrono::DateTime<Utc>,
    ) -> Signal {
        let sign = direction.sign();
        let mut signal = Signal {
            id: None,
            symbol: symbol.to_string(),
            direction,
            confidence: 82.0,
            strength: 85.0,
            entry_price: 100.0,
            stop_loss: 100.0 - sign * 2.0,
            take_profits: [3.0, 5.0, 8.0].map(|d| 100.0 + sign * d),
            risk_reward: 2.5,
            position_size_usd: 100.0,
            leverage,
            layers: Vec::new(),
            tier: "top10".to_string(),
            created_at,
            expires_at: created_at + chrono::Duration::minutes(5),
            status: SignalStatus::Pending,
            status_reason: None,
        };
        signal.id = Some(store.insert_signal(&signal).await.unwrap());
        signal
    }

    // -----------------------------------------------------------------------
    // Signal generation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_weighted_confidence_sums_layer_contributions() {
        let store = Arc::new(MemoryStore::new());
        let generator = generator(store);

        // 0.35*90 + 0.20*80 + 0.15*70 + 0.10*70 + 0.15*85 + 0.05*70
        assert_relative_eq!(
            generator.weighted_confidence(&bullish_scores()),
            81.25,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            generator.weighted_confidence(&LayerScores::new()),
            50.0,
            epsilon = 1e-9
        );
    }

    #[tokio::test]
    async fn test_signal_below_threshold_is_not_persisted() {
        let store = Arc::new(MemoryStore::new());
        let generator = generator(store.clone());
        let now = Utc::now();

        let signal = generator
            .generate("BTCUSDT", 100.0, &bullish_scores(), &tier(85.0, &[]), &account(), now)
            .await
            .unwrap();

        assert!(signal.is_none());
        assert!(store.pending_signals(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_qualifying_signal_is_sized_priced_and_pending() {
        let store = Arc::new(MemoryStore::new());
        let generator = generator(store.clone());
        let now = Utc::now();

        let signal = generator
            .generate("BTCUSDT", 100.0, &bullish_scores(), &tier(75.0, &[]), &account(), now)
            .await
            .unwrap()
            .expect("signal above threshold");

        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.status, SignalStatus::Pending);
        assert_relative_eq!(signal.strength, 85.0, epsilon = 1e-9);
        // conf 81.25 / strength 85 unlocks the 10x tier; stop is 20% / 10x = 2%
        assert_eq!(signal.leverage, 10);
        assert_relative_eq!(signal.stop_loss, 98.0, epsilon = 1e-9);
        assert_relative_eq!(signal.take_profits[0], 103.0, epsilon = 1e-9);
        assert_relative_eq!(signal.take_profits[2], 108.0, epsilon = 1e-9);
        assert!(signal.position_size_usd > 0.0 && signal.position_size_usd <= 1_000.0);
        assert_eq!(signal.layers.len(), 6);
        assert_eq!(signal.expires_at, now + chrono::Duration::seconds(300));

        let pending = store.pending_signals(now, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, signal.id);
    }

    #[test]
    fn test_direction_follows_leans_not_conviction() {
        assert_eq!(resolve_direction(&scores_leaning(Direction::Long)), Direction::Long);
        assert_eq!(resolve_direction(&scores_leaning(Direction::Short)), Direction::Short);

        // High conviction with no lean anywhere is a tie, which goes long
        let no_lean: LayerScores = Layer::ALL
            .into_iter()
            .map(|layer| (layer, LayerReading::new(90.0, "no view")))
            .collect();
        assert_eq!(resolve_direction(&no_lean), Direction::Long);
        assert_eq!(resolve_direction(&LayerScores::new()), Direction::Long);

        // One strongly bearish layer decides when the rest have no view
        let mut one_bear = no_lean.clone();
        one_bear.insert(
            Layer::Technical,
            LayerReading::new(90.0, "breakdown").leaning(Direction::Short),
        );
        assert_eq!(resolve_direction(&one_bear), Direction::Short);
    }

    #[test]
    fn test_flushed_longs_vote_short() {
        let scores: LayerScores = [(
            Layer::Liquidation,
            LayerReading::new(80.0, "longs flushed").leaning(Direction::Long),
        )]
        .into_iter()
        .collect();
        assert_eq!(resolve_direction(&scores), Direction::Short);

        // Technical 3 x 60 outweighs liquidation 1.5 x 80
        let mut mixed = scores.clone();
        mixed.insert(
            Layer::Technical,
            LayerReading::new(60.0, "uptrend").leaning(Direction::Long),
        );
        assert_eq!(resolve_direction(&mixed), Direction::Long);
    }

    #[test]
    fn test_signal_strength_is_mean_of_top_three() {
        assert_relative_eq!(signal_strength(&bullish_scores()), 85.0, epsilon = 1e-9);

        let two: LayerScores = [
            (Layer::Technical, LayerReading::new(60.0, "a")),
            (Layer::Ml, LayerReading::new(40.0, "b")),
        ]
        .into_iter()
        .collect();
        assert_relative_eq!(signal_strength(&two), 50.0, epsilon = 1e-9);
        assert_eq!(signal_strength(&LayerScores::new()), 0.0);
    }

    #[tokio::test]
    async fn test_liquidation_scorer_leans_to_flushed_side() {
        let tracker = Arc::new(LiquidationTracker::new(Duration::from_secs(3600)));
        let scorer = LiquidationScorer::new(tracker.clone());

        let empty = scorer.score("BTCUSDT").await.unwrap();
        assert_eq!(empty.score, LayerReading::NEUTRAL);
        assert_eq!(empty.lean, None);

        let now = Utc::now();
        for (liquidated, qty) in [(Direction::Long, 30.0), (Direction::Short, 10.0)] {
            tracker.record(LiquidationEvent {
                symbol: "BTCUSDT".to_string(),
                liquidated,
                price: 100.0,
                qty,
                time: now,
            });
        }

        // 75% of the flushed notional was long: conviction 75, leaning long
        let reading = scorer.score("BTCUSDT").await.unwrap();
        assert_relative_eq!(reading.score, 75.0, epsilon = 1e-9);
        assert_eq!(reading.lean, Some(Direction::Long));
    }

    #[tokio::test]
    async fn test_bearish_readings_produce_short_with_inverted_levels() {
        let store = Arc::new(MemoryStore::new());
        let generator = generator(store.clone());
        let now = Utc::now();

        let signal = generator
            .generate(
                "ETHUSDT",
                100.0,
                &scores_leaning(Direction::Short),
                &tier(75.0, &[]),
                &account(),
                now,
            )
            .await
            .unwrap()
            .expect("signal above threshold");

        assert_eq!(signal.direction, Direction::Short);
        assert_eq!(signal.leverage, 10);
        assert_relative_eq!(signal.stop_loss, 102.0, epsilon = 1e-9);
        assert_relative_eq!(signal.take_profits[0], 97.0, epsilon = 1e-9);
        assert_relative_eq!(signal.take_profits[1], 95.0, epsilon = 1e-9);
        assert_relative_eq!(signal.take_profits[2], 92.0, epsilon = 1e-9);
        let liquidation = signal
            .layers
            .iter()
            .find(|c| c.layer == Layer::Liquidation)
            .unwrap();
        assert_eq!(liquidation.lean, Some(Direction::Long));
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_leverage_falls_back_down_the_ladder() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        let executor = executor(exchange.clone(), store.clone(), FixedGate::new(true), false);
        let signal = insert_pending(&store, "BTCUSDT", 125, Utc::now()).await;

        let outcome = executor.execute_signal(&signal).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Executed { leverage: 25, .. }));
        assert_eq!(*exchange.leverage_attempts.lock().unwrap(), vec![125, 100, 75, 50, 25]);

        let executions = store.executions().await;
        assert_eq!(executions.len(), 1);
        let execution = &executions[0];
        assert_eq!(execution.requested_leverage, 125);
        assert_eq!(execution.actual_leverage, 25);
        // $100 margin at 25x on a $100 price
        assert_relative_eq!(execution.quantity, 25.0, epsilon = 1e-9);
        assert_relative_eq!(execution.margin_used, 100.0, epsilon = 1e-6);
        assert_eq!(execution.signal_id, signal.id);

        let stored = store.get_signal(signal.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Executed);
    }

    #[tokio::test]
    async fn test_entry_places_take_profit_ladder_and_trailing_stop() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        let executor = executor(exchange.clone(), store.clone(), FixedGate::new(true), false);
        let signal = insert_pending(&store, "ETHUSDT", 10, Utc::now()).await;

        executor.execute_signal(&signal).await.unwrap();

        let orders = exchange.orders();
        assert_eq!(orders.len(), 4);
        assert_eq!(orders[0].order_type, OrderType::Market);
        assert_eq!(orders[0].stop_loss, Some(98.0));
        assert_eq!(orders[0].take_profit, None);

        let legs: Vec<f64> = orders[1..].iter().map(|o| o.qty).collect();
        assert!(orders[1..].iter().all(|o| o.reduce_only && o.side == OrderSide::Sell));
        assert_relative_eq!(legs.iter().sum::<f64>(), 10.0, epsilon = 1e-9);
        assert_relative_eq!(legs[0], 4.0, epsilon = 1e-9);

        let stops = exchange.stops.lock().unwrap().clone();
        assert_eq!(stops.len(), 1);
        assert_relative_eq!(stops[0].trailing_stop.unwrap(), 1.5, epsilon = 1e-9);
        assert_relative_eq!(stops[0].active_price.unwrap(), 102.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_claimed_signal_is_not_executed_twice() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        let executor = executor(exchange.clone(), store.clone(), FixedGate::new(true), false);
        let signal = insert_pending(&store, "SOLUSDT", 10, Utc::now()).await;

        let first = executor.execute_signal(&signal).await.unwrap();
        assert!(matches!(first, ExecutionOutcome::Executed { .. }));
        let placed = exchange.orders().len();

        // A second worker holding the same snapshot loses the claim
        let second = executor.execute_signal(&signal).await.unwrap();
        assert_eq!(second, ExecutionOutcome::Lost);
        assert_eq!(exchange.orders().len(), placed);
        assert_eq!(store.executions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_one_entry_per_symbol_per_tick() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        let executor = executor(exchange.clone(), store.clone(), FixedGate::new(true), false);
        let now = Utc::now();
        let older = insert_pending(&store, "BTCUSDT", 10, now - chrono::Duration::seconds(30)).await;
        let newer = insert_pending(&store, "BTCUSDT", 10, now).await;

        let summary = executor.run_once(now).await.unwrap();
        assert_eq!(summary.executed, 1);
        assert_eq!(summary.rejected, 1);

        let newer = store.get_signal(newer.id.unwrap()).await.unwrap().unwrap();
        let older = store.get_signal(older.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(newer.status, SignalStatus::Executed);
        assert_eq!(older.status, SignalStatus::Rejected);
    }

    #[tokio::test]
    async fn test_expired_signals_are_never_executed() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        let executor = executor(exchange.clone(), store.clone(), FixedGate::new(true), false);
        let created = Utc::now() - chrono::Duration::minutes(10);
        let stale = insert_pending(&store, "BTCUSDT", 10, created).await;

        let summary = executor.run_once(Utc::now()).await.unwrap();
        assert_eq!(summary.expired, 1);
        assert_eq!(summary.executed, 0);
        assert!(exchange.orders().is_empty());

        let stale = store.get_signal(stale.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stale.status, SignalStatus::Expired);
    }

    #[tokio::test]
    async fn test_existing_position_rejects_signal() {
        let exchange = MockExchange::new(25);
        exchange.set_positions(vec![position("BTCUSDT", OrderSide::Sell, 1.0, 100.0)]);
        let store = Arc::new(MemoryStore::new());
        let executor = executor(exchange.clone(), store.clone(), FixedGate::new(true), false);
        let signal = insert_pending(&store, "BTCUSDT", 10, Utc::now()).await;

        let outcome = executor.execute_signal(&signal).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Rejected(_)));
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_risk_gate_denial_rejects_signal() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        let gate = FixedGate::new(false);
        let executor = executor(exchange.clone(), store.clone(), gate.clone(), false);
        let signal = insert_pending(&store, "BTCUSDT", 10, Utc::now()).await;

        let outcome = executor.execute_signal(&signal).await.unwrap();
        match outcome {
            ExecutionOutcome::Rejected(reason) => assert!(reason.contains("Daily loss limit")),
            other => panic!("expected rejection, got {:?}", other),
        }
        // $100 of a $10,000 account
        assert_eq!(gate.seen.lock().unwrap().len(), 1);
        assert_relative_eq!(gate.seen.lock().unwrap()[0], 1.0, epsilon = 1e-9);
        assert!(exchange.orders().is_empty());

        let stored = store.get_signal(signal.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Rejected);
    }

    #[tokio::test]
    async fn test_market_filter_blocks_counter_trend_entry() {
        let exchange = MockExchange::new(25);
        // Falling hourly closes: EMA20 below EMA50, so a long is against trend
        *exchange.closes.lock().unwrap() = (0..120).map(|i| 200.0 - i as f64).collect();
        let store = Arc::new(MemoryStore::new());
        let executor = executor(exchange.clone(), store.clone(), FixedGate::new(true), true);
        let signal = insert_pending(&store, "BTCUSDT", 10, Utc::now()).await;

        let outcome = executor.execute_signal(&signal).await.unwrap();
        match outcome {
            ExecutionOutcome::Rejected(reason) => assert!(reason.starts_with("Market filter")),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(exchange.leverage_attempts.lock().unwrap().is_empty());
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_market_filter_fails_open_without_candles() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        let executor = executor(exchange.clone(), store.clone(), FixedGate::new(true), true);
        let signal = insert_pending(&store, "BTCUSDT", 10, Utc::now()).await;

        let outcome = executor.execute_signal(&signal).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));
    }

    #[tokio::test]
    async fn test_short_entry_mirrors_stops_and_take_profits() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        let executor = executor(exchange.clone(), store.clone(), FixedGate::new(true), false);
        let signal = insert_directed(&store, "ETHUSDT", Direction::Short, 10, Utc::now()).await;

        let outcome = executor.execute_signal(&signal).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Executed { leverage: 10, .. }));

        let orders = exchange.orders();
        assert_eq!(orders.len(), 4);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert!(!orders[0].reduce_only);
        assert_eq!(orders[0].position_idx, 2);
        assert_eq!(orders[0].stop_loss, Some(102.0));

        assert!(orders[1..].iter().all(|o| o.reduce_only && o.side == OrderSide::Buy));
        let targets: Vec<Option<f64>> = orders[1..].iter().map(|o| o.price).collect();
        assert_eq!(targets, vec![Some(97.0), Some(95.0), Some(92.0)]);

        let stops = exchange.stops.lock().unwrap().clone();
        assert_relative_eq!(stops[0].active_price.unwrap(), 98.0, epsilon = 1e-9);

        let execution = &store.executions().await[0];
        assert_eq!(execution.direction, Direction::Short);
        assert_eq!(execution.side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn test_leverage_negotiation_stops_on_transport_error() {
        let exchange = MockExchange::new(25);
        *exchange.leverage_error.lock().unwrap() =
            Some(ExchangeError::Network("connection reset".to_string()));
        let store = Arc::new(MemoryStore::new());
        let executor = executor(exchange.clone(), store.clone(), FixedGate::new(true), false);

        assert_eq!(executor.negotiate_leverage("BTCUSDT", 50).await, 0);
        assert_eq!(*exchange.leverage_attempts.lock().unwrap(), vec![50]);

        let signal = insert_pending(&store, "BTCUSDT", 50, Utc::now()).await;
        let outcome = executor.execute_signal(&signal).await.unwrap();
        match outcome {
            ExecutionOutcome::Rejected(reason) => assert!(reason.contains("No leverage accepted")),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(exchange.leverage_attempts.lock().unwrap().len(), 2);
        assert!(exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn test_execution_record_is_retried() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(FlakyStore::default());
        store.fail_execution_inserts.store(1, Ordering::SeqCst);
        let executor = executor(exchange.clone(), store.clone(), FixedGate::new(true), false);
        let signal = insert_pending(&store.inner, "BTCUSDT", 10, Utc::now()).await;

        let outcome = executor.execute_signal(&signal).await.unwrap();
        let execution_id = match outcome {
            ExecutionOutcome::Executed { execution_id, .. } => execution_id,
            other => panic!("expected execution, got {:?}", other),
        };
        let executions = store.inner.executions().await;
        assert_eq!(executions.len(), 1);
        assert_eq!(execution_id, executions[0].id);
    }

    #[tokio::test]
    async fn test_unsaved_execution_alerts_and_is_adopted() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(FlakyStore::default());
        store.fail_execution_inserts.store(3, Ordering::SeqCst);
        let sink = Arc::new(RecordingSink::default());
        let executor = executor_alerting(
            exchange.clone(),
            store.clone(),
            FixedGate::new(true),
            false,
            sink.clone(),
        );
        let signal = insert_pending(&store.inner, "BTCUSDT", 10, Utc::now()).await;

        let outcome = executor.execute_signal(&signal).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Executed {
                execution_id: None,
                leverage: 10
            }
        );
        assert!(store.inner.executions().await.is_empty());
        let stored = store.get_signal(signal.id.unwrap()).await.unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Executed);

        let alerts = sink.alerts.lock().unwrap().clone();
        let unrecorded: Vec<&Alert> = alerts
            .iter()
            .filter(|a| a.kind == AlertKind::ExecutionUnrecorded)
            .collect();
        assert_eq!(unrecorded.len(), 1);
        assert_eq!(unrecorded[0].severity, AlertSeverity::Critical);

        // The position manager writes the missing record from the exchange
        exchange.set_positions(vec![position("BTCUSDT", OrderSide::Buy, 10.0, 100.0)]);
        let manager = PositionManager::new(
            exchange.clone(),
            store.clone(),
            Arc::new(LogAlertSink),
            2.0,
            1.5,
        );
        let summary = manager.poll(Utc::now()).await.unwrap();
        assert_eq!(summary.tracked, 1);

        let executions = store.inner.executions().await;
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].signal_id, None);
        assert_eq!(executions[0].status, ExecutionStatus::Open);
        assert_eq!(executions[0].actual_leverage, 10);
        assert_relative_eq!(executions[0].quantity, 10.0, epsilon = 1e-9);
        assert_relative_eq!(executions[0].margin_used, 100.0, epsilon = 1e-9);
        let state = manager.state("BTCUSDT", Direction::Long).unwrap();
        assert_eq!(state.execution_id, executions[0].id);
    }

    #[tokio::test]
    async fn test_stale_approved_signals_are_resolved() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(FlakyStore::default());
        store.fail_executed_transitions.store(3, Ordering::SeqCst);
        let executor = executor(exchange.clone(), store.clone(), FixedGate::new(true), false);
        let now = Utc::now();

        let filled = insert_pending(&store.inner, "BTCUSDT", 10, now).await;
        let outcome = executor.execute_signal(&filled).await.unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Executed {
                execution_id: Some(_),
                ..
            }
        ));
        let filled_id = filled.id.unwrap();
        let stuck = store.get_signal(filled_id).await.unwrap().unwrap();
        assert_eq!(stuck.status, SignalStatus::Approved);

        // A claim whose worker died before reaching the exchange
        let abandoned = insert_pending(&store.inner, "ETHUSDT", 10, now).await;
        let abandoned_id = abandoned.id.unwrap();
        assert!(store
            .transition_signal(abandoned_id, SignalStatus::Pending, SignalStatus::Approved, None)
            .await
            .unwrap());

        // Still inside the TTL: claims may be in flight, nothing is touched
        let summary = executor.run_once(now).await.unwrap();
        assert_eq!(summary.recovered, 0);

        let summary = executor
            .run_once(now + chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(summary.recovered, 2);

        let filled = store.get_signal(filled_id).await.unwrap().unwrap();
        assert_eq!(filled.status, SignalStatus::Executed);
        let abandoned = store.get_signal(abandoned_id).await.unwrap().unwrap();
        assert_eq!(abandoned.status, SignalStatus::Rejected);
        assert_eq!(store.inner.executions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_positions_flattens_book() {
        let exchange = MockExchange::new(25);
        exchange.set_positions(vec![
            position("BTCUSDT", OrderSide::Buy, 0.5, 100.0),
            position("ETHUSDT", OrderSide::Sell, 2.0, 100.0),
        ]);
        let store = Arc::new(MemoryStore::new());
        let executor = executor(exchange.clone(), store, FixedGate::new(true), false);

        let closed = executor.close_all_positions("Emergency stop").await.unwrap();
        assert_eq!(closed, 2);

        let orders = exchange.orders();
        assert!(orders.iter().all(|o| o.reduce_only && o.order_type == OrderType::Market));
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[1].side, OrderSide::Buy);
        assert_eq!(exchange.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_take_profit_split_covers_whole_quantity() {
        let legs = split_quantity(1.0, 0.001);
        assert_relative_eq!(legs[0], 0.4, epsilon = 1e-9);
        assert_relative_eq!(legs[1], 0.3, epsilon = 1e-9);
        assert_relative_eq!(legs[2], 0.3, epsilon = 1e-9);

        // Remainder lands on the last leg
        let legs = split_quantity(7.0, 1.0);
        assert_eq!(legs, [2.0, 2.0, 3.0]);
    }

    // -----------------------------------------------------------------------
    // Position manager
    // -----------------------------------------------------------------------

    fn open_long(symbol: &str, opened_at: chrono::DateTime<Utc>) -> Execution {
        Execution {
            id: None,
            signal_id: Some(1),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            direction: Direction::Long,
            order_type: OrderType::Market,
            order_id: Some("order-1".to_string()),
            requested_leverage: 10,
            actual_leverage: 10,
            quantity: 1.0,
            notional_usd: 100.0,
            margin_used: 10.0,
            entry_price: 100.0,
            exit_price: None,
            stop_loss: Some(98.0),
            take_profit: Some(108.0),
            realized_pnl: None,
            unrealized_pnl: 0.0,
            funding_fees: 0.0,
            trading_fees: 0.0,
            status: ExecutionStatus::Open,
            opened_at,
            closed_at: None,
            excursion: Excursion::default(),
            close_reason: None,
        }
    }

    #[tokio::test]
    async fn test_position_manager_trails_then_finalizes_closed_position() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();

        let execution = open_long("BTCUSDT", now - chrono::Duration::hours(1));
        let execution_id = store.insert_execution(&execution).await.unwrap();

        let manager = PositionManager::new(
            exchange.clone(),
            store.clone(),
            Arc::new(LogAlertSink),
            2.0,
            1.5,
        );
        assert_eq!(manager.rehydrate().await.unwrap(), 1);

        // +3% arms the trailing stop
        exchange.set_positions(vec![position("BTCUSDT", OrderSide::Buy, 1.0, 103.0)]);
        let summary = manager.poll(now).await.unwrap();
        assert_eq!(summary.tracked, 1);
        assert_eq!(summary.stops_moved, 1);
        let state = manager.state("BTCUSDT", Direction::Long).unwrap();
        assert!(state.trailing_active);
        assert!(state.trailing_stop.unwrap() > 100.0);

        // Same price again: nothing new to push
        let summary = manager.poll(now).await.unwrap();
        assert_eq!(summary.stops_moved, 0);
        assert_eq!(exchange.stops.lock().unwrap().len(), 1);

        // Position stopped out on the exchange
        exchange.set_positions(Vec::new());
        *exchange.closed_pnl.lock().unwrap() = vec![ClosedPnl {
            symbol: "BTCUSDT".to_string(),
            direction: Direction::Long,
            qty: 1.0,
            avg_entry_price: 100.0,
            avg_exit_price: 101.5,
            closed_pnl: 1.5,
            created_at: now,
        }];
        let summary = manager.poll(now).await.unwrap();
        assert_eq!(summary.closed, 1);
        assert_eq!(manager.tracked(), 0);

        let closed = store
            .executions()
            .await
            .into_iter()
            .find(|e| e.id == Some(execution_id))
            .unwrap();
        assert_eq!(closed.status, ExecutionStatus::Closed);
        assert_eq!(closed.exit_price, Some(101.5));
        assert_eq!(closed.realized_pnl, Some(1.5));
        assert!(closed.excursion.mfe_percent >= 3.0 - 1e-9);
    }

    #[tokio::test]
    async fn test_failed_finalize_keeps_state_for_retry() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(FlakyStore::default());
        let now = Utc::now();
        let execution_id = store
            .insert_execution(&open_long("SOLUSDT", now - chrono::Duration::hours(2)))
            .await
            .unwrap();
        store.fail_closes.store(1, Ordering::SeqCst);

        let manager = PositionManager::new(
            exchange.clone(),
            store.clone(),
            Arc::new(LogAlertSink),
            2.0,
            1.5,
        );
        assert_eq!(manager.rehydrate().await.unwrap(), 1);

        // Gone from the exchange, but the close cannot be written yet
        let summary = manager.poll(now).await.unwrap();
        assert_eq!(summary.closed, 0);
        assert_eq!(summary.tracked, 1);
        assert!(manager.state("SOLUSDT", Direction::Long).is_some());

        let summary = manager.poll(now).await.unwrap();
        assert_eq!(summary.closed, 1);
        assert_eq!(manager.tracked(), 0);

        let closed = store
            .inner
            .executions()
            .await
            .into_iter()
            .find(|e| e.id == Some(execution_id))
            .unwrap();
        assert_eq!(closed.status, ExecutionStatus::Closed);
    }

    // -----------------------------------------------------------------------
    // Scanner
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_pass_counts_failures_without_aborting() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        let scanner = TierScanner::new(
            tier(75.0, &["BTCUSDT", "BADUSDT", "ETHUSDT"]),
            exchange,
            bullish_scorers(),
            generator(store.clone()),
            2,
        );

        let outcome = scanner.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.symbols_scanned, 3);
        assert_eq!(outcome.signals_found, 2);
        assert_eq!(outcome.errors, 1);
        assert_eq!(store.pending_signals(Utc::now(), 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_signals_in_one_pass_share_exposure_budget() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        // $1,500 of margin allowed on $10,000; each qualifying signal sizes to $1,000
        let sizer = KellyPositionSizer {
            max_total_exposure_percent: 15.0,
            ..KellyPositionSizer::default()
        };
        let scanner = TierScanner::new(
            tier(75.0, &["BTCUSDT", "ETHUSDT", "SOLUSDT"]),
            exchange,
            bullish_scorers(),
            generator_with(store.clone(), sizer),
            3,
        );

        let outcome = scanner.run_pass(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.symbols_scanned, 3);
        assert_eq!(outcome.signals_found, 2);

        let pending = store.pending_signals(Utc::now(), 10).await.unwrap();
        let committed: f64 = pending.iter().map(|s| s.position_size_usd).sum();
        assert_relative_eq!(committed, 1_500.0, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn test_cancelled_pass_persists_nothing() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        let scanner = TierScanner::new(
            tier(75.0, &["BTCUSDT"]),
            exchange,
            bullish_scorers(),
            generator(store.clone()),
            1,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(scanner.run_pass(&cancel).await.is_none());
        assert!(store.pending_signals(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_scorers_read_neutral() {
        let scores = ScorerSet::default().score_all("BTCUSDT").await;
        assert_eq!(scores.len(), 6);
        assert!(scores.values().all(|r| r.degraded && r.score == 50.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_a_running_tier_is_a_no_op() {
        let exchange = MockExchange::new(25);
        let store = Arc::new(MemoryStore::new());
        let mut scheduler = ScannerScheduler::new(store.clone(), CancellationToken::new());
        scheduler.add_tier(TierScanner::new(
            tier(75.0, &["BTCUSDT"]),
            exchange,
            ScorerSet::default(),
            generator(store.clone()),
            4,
        ));

        assert!(scheduler.start_tier("top10").unwrap());
        assert!(!scheduler.start_tier("top10").unwrap());
        assert!(scheduler.is_running("top10"));
        assert!(scheduler.start_tier("top99").is_err());

        // Let the first pass run; neutral scores never qualify
        tokio::time::sleep(Duration::from_secs(1)).await;
        let metrics = scheduler.metrics("top10").unwrap();
        assert_eq!(metrics.passes, 1);
        assert_eq!(metrics.signals_found, 0);
        assert_eq!(store.scans().await.len(), 1);

        assert!(scheduler.stop_tier("top10").await);
        assert!(!scheduler.is_running("top10"));
        assert!(!scheduler.stop_tier("top10").await);
    }
}
