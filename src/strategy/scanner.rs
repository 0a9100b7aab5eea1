//! Universe scan: fetch, gate, score and rank.

use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};

use super::gate::GateEvaluator;
use super::scoring::{rank, Candidate, ScoringEngine};
use crate::config::Config;
use crate::decision::{AbortReason, DecisionRecord, ReasonCode};
use crate::market_data::features::{self, FeatureSet};
use crate::market_data::{MarketDataProvider, MarketSnapshot, ProviderError};

/// Result of one universe scan.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Gated candidates, best first
    pub candidates: Vec<Candidate>,
    /// One record per symbol in scan order
    pub decisions: Vec<DecisionRecord>,
    pub abort: Option<AbortReason>,
    pub scanned: usize,
    pub mapping_failures: usize,
    pub cancelled: bool,
}

impl ScanOutcome {
    pub fn decision_mut(&mut self, symbol: &str) -> Option<&mut DecisionRecord> {
        self.decisions.iter_mut().find(|d| d.symbol == symbol)
    }
}

enum SymbolResult {
    Candidate(Candidate, DecisionRecord),
    Rejected(DecisionRecord),
    Unmapped(DecisionRecord),
}

pub struct Scanner {
    gate: GateEvaluator,
    scoring: ScoringEngine,
    max_mapping_failure_rate: Decimal,
    min_symbols_for_abort: usize,
    symbol_timeout: Duration,
}

impl Scanner {
    pub fn new(config: &Config) -> Self {
        Self {
            gate: GateEvaluator::new(
                config.gate.clone(),
                config.alt_data.clone(),
                config.fast_lane.clone(),
            ),
            scoring: ScoringEngine::new(&config.scoring, &config.alt_data),
            max_mapping_failure_rate: config.universe.max_mapping_failure_rate,
            min_symbols_for_abort: config.universe.min_symbols_for_abort,
            symbol_timeout: Duration::from_secs(config.scheduler.symbol_timeout_secs),
        }
    }

    /// Scan `symbols` in order, stopping at a symbol boundary if `cancel` is set.
    #[instrument(skip(self, symbols, provider, cancel), fields(symbols = symbols.len()))]
    pub async fn scan(
        &self,
        cycle_id: u64,
        symbols: &[String],
        provider: &dyn MarketDataProvider,
        kill_switch_engaged: bool,
        cancel: &AtomicBool,
    ) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();

        if let Err(abort) = self.gate.check_cycle(kill_switch_engaged) {
            warn!("Scan aborted before start: {:?}", abort);
            for symbol in symbols {
                let mut record = DecisionRecord::new(cycle_id, symbol);
                record.skip(abort.reason_code());
                outcome.decisions.push(record);
            }
            outcome.abort = Some(abort);
            return outcome;
        }

        let mut rejected = 0usize;
        for symbol in symbols {
            if cancel.load(Ordering::SeqCst) {
                let mut record = DecisionRecord::new(cycle_id, symbol);
                record.skip(ReasonCode::CycleCancelled);
                outcome.decisions.push(record);
                outcome.cancelled = true;
                continue;
            }

            outcome.scanned += 1;
            match self.scan_symbol(cycle_id, symbol, provider).await {
                SymbolResult::Candidate(candidate, record) => {
                    outcome.candidates.push(candidate);
                    outcome.decisions.push(record);
                }
                SymbolResult::Rejected(record) => {
                    rejected += 1;
                    outcome.decisions.push(record);
                }
                SymbolResult::Unmapped(record) => {
                    outcome.mapping_failures += 1;
                    outcome.decisions.push(record);
                }
            }
        }

        if self.mapping_failure_exceeded(outcome.mapping_failures, outcome.scanned) {
            let abort = AbortReason::UniverseMappingFailure {
                failed: outcome.mapping_failures,
                scanned: outcome.scanned,
            };
            warn!(
                failed = outcome.mapping_failures,
                scanned = outcome.scanned,
                "Too many symbols could not be mapped to data; aborting scan"
            );
            for candidate in outcome.candidates.drain(..) {
                if let Some(record) = outcome.decisions.iter_mut().find(|d| d.symbol == candidate.symbol) {
                    record.skip(ReasonCode::UniverseMappingFailure);
                }
            }
            outcome.abort = Some(abort);
            return outcome;
        }

        rank(&mut outcome.candidates);
        for (idx, candidate) in outcome.candidates.iter().enumerate() {
            if let Some(record) = outcome.decisions.iter_mut().find(|d| d.symbol == candidate.symbol) {
                record.rank = Some(idx + 1);
            }
        }

        info!(
            scanned = outcome.scanned,
            candidates = outcome.candidates.len(),
            rejected,
            mapping_failures = outcome.mapping_failures,
            cancelled = outcome.cancelled,
            "Universe scan complete"
        );
        outcome
    }

    fn mapping_failure_exceeded(&self, failed: usize, scanned: usize) -> bool {
        if scanned == 0 || scanned < self.min_symbols_for_abort {
            return false;
        }
        let rate = Decimal::from(failed as u64) / Decimal::from(scanned as u64);
        rate > self.max_mapping_failure_rate
    }

    async fn timed<T, F>(&self, fut: F) -> Result<T, ProviderError>
    where
        F: std::future::Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.symbol_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.symbol_timeout)),
        }
    }

    async fn scan_symbol(
        &self,
        cycle_id: u64,
        symbol: &str,
        provider: &dyn MarketDataProvider,
    ) -> SymbolResult {
        let mut record = DecisionRecord::new(cycle_id, symbol);

        let snapshot: MarketSnapshot = match self.timed(provider.fetch_snapshot(symbol)).await {
            Ok(snapshot) => snapshot,
            Err(ProviderError::MissingData { field, .. }) => {
                debug!(%symbol, %field, "No data for symbol");
                record.reject(ReasonCode::MissingData);
                return SymbolResult::Unmapped(record);
            }
            Err(e) => {
                warn!(%symbol, "Snapshot unavailable: {}", e);
                record.reject(ReasonCode::ProviderUnavailable);
                return SymbolResult::Rejected(record);
            }
        };

        if self.gate.is_stale(&snapshot) {
            trace!(%symbol, age_secs = snapshot.age_secs, "Snapshot too old");
            record.reject(ReasonCode::StaleSnapshot);
            return SymbolResult::Rejected(record);
        }

        if let Err(reason) = self.gate.check_price_band(&snapshot) {
            trace!(%symbol, price = %snapshot.price, "Outside price band");
            record.gate = Some(self.gate.price_band_rejection(symbol, reason));
            record.reject(reason);
            return SymbolResult::Rejected(record);
        }

        let alt = match self.timed(provider.fetch_alt_features(symbol)).await {
            Ok(features) => features,
            Err(e) => {
                // continue on whatever the snapshot alone supports
                debug!(%symbol, "Alt features unavailable: {}", e);
                record.partial_data = true;
                FeatureSet::new()
            }
        };

        let decision = self.gate.evaluate(&snapshot, &alt);
        if !decision.passed() {
            trace!(%symbol, reasons = ?decision.reasons, "Gate rejected");
            for reason in &decision.reasons {
                record.reject(*reason);
            }
            record.gate = Some(decision);
            return SymbolResult::Rejected(record);
        }

        let mut scored = alt;
        if let Some(trend) = snapshot.trend_positive {
            let flag = if trend { Decimal::ONE } else { Decimal::ZERO };
            scored.insert(features::TREND_POSITIVE, flag, None);
        }
        let score = self.scoring.score(&scored);
        record.score = Some(score.total);

        let candidate = Candidate {
            symbol: snapshot.symbol.clone(),
            score: score.total,
            secondary_strength: score.alt_data,
            liquidity: snapshot.dollar_volume(),
            price: snapshot.price,
            volatility: snapshot.volatility,
            fast_lane: decision.fast_lane,
        };
        record.gate = Some(decision);
        SymbolResult::Candidate(candidate, record)
    }
}
