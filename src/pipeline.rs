use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::alerts;
use crate::error::{ScoringError, ServiceError};
use crate::features::Features;
use crate::model::ScorerHandle;
use crate::store::StateStore;
use crate::types::{Reading, ScoreResult};

/// Reading in, score out. Shared by the single-shot and streaming handlers.
#[derive(Clone)]
pub struct Pipeline {
    store: Arc<StateStore>,
    scorer: Arc<ScorerHandle>,
    timeout: Duration,
    log_predictions: bool,
}

impl Pipeline {
    pub fn new(store: Arc<StateStore>, scorer: Arc<ScorerHandle>, timeout: Duration) -> Self {
        Self {
            store,
            scorer,
            timeout,
            log_predictions: false,
        }
    }

    pub fn log_predictions(mut self, on: bool) -> Self {
        self.log_predictions = on;
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn scorer(&self) -> &Arc<ScorerHandle> {
        &self.scorer
    }

    /// Update the vehicle's window, then score.
    ///
    /// The window update is synchronous and finishes before the first await,
    /// so dropping this future never leaves a half-applied reading. The
    /// update stays committed when scoring fails or times out. A reading the
    /// window cannot absorb is a validation error and changes nothing.
    pub async fn process(&self, reading: Reading) -> Result<ScoreResult, ServiceError> {
        let stats = self.store.append(&reading.vehicle_id, reading.engine_rpm)?;
        let features = Features::assemble(&reading, stats);

        let scorer = self.scorer.current();
        let vector = features.to_vector();
        let job = tokio::task::spawn_blocking(move || scorer.score(&vector));
        let probability = match tokio::time::timeout(self.timeout, job).await {
            Err(_) => return Err(ServiceError::Timeout(self.timeout.as_millis() as u64)),
            Ok(Err(join)) => return Err(ScoringError::Classifier(join.to_string()).into()),
            Ok(Ok(scored)) => scored?,
        };

        let result = ScoreResult::from_probability(probability, features, alerts::evaluate(&features));
        if self.log_predictions {
            info!(
                vehicle_id = %reading.vehicle_id,
                rpm = reading.engine_rpm,
                mean = stats.mean,
                std = stats.std,
                probability,
                prediction = result.prediction,
                health = result.health_score,
                "scored reading"
            );
        } else {
            debug!(vehicle_id = %reading.vehicle_id, probability, "scored reading");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FEATURE_DIM;
    use crate::model::{Classifier, Scorer, Standardizer};

    struct Fixed(f64);

    impl Classifier for Fixed {
        fn n_features(&self) -> usize {
            FEATURE_DIM
        }
        fn predict_proba(&self, _x: &[f64]) -> Result<f64, ScoringError> {
            Ok(self.0)
        }
    }

    struct Slow;

    impl Classifier for Slow {
        fn n_features(&self) -> usize {
            FEATURE_DIM
        }
        fn predict_proba(&self, _x: &[f64]) -> Result<f64, ScoringError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(0.1)
        }
    }

    struct Broken;

    impl Classifier for Broken {
        fn n_features(&self) -> usize {
            FEATURE_DIM
        }
        fn predict_proba(&self, _x: &[f64]) -> Result<f64, ScoringError> {
            Err(ScoringError::Classifier("boom".into()))
        }
    }

    fn pipeline(c: Box<dyn Classifier>, timeout: Duration) -> Pipeline {
        let scaler = Standardizer::new(vec![0.0; FEATURE_DIM], vec![1.0; FEATURE_DIM]).unwrap();
        let scorer = Scorer::new("test", scaler, c).unwrap();
        Pipeline::new(
            Arc::new(StateStore::new(100)),
            Arc::new(ScorerHandle::new(scorer, None)),
            timeout,
        )
    }

    #[tokio::test]
    async fn result_fields_follow_probability() {
        let p = pipeline(Box::new(Fixed(0.8)), Duration::from_secs(1));
        let out = p.process(Reading::rpm("car-1", 1500.0)).await.unwrap();
        assert_eq!(out.prediction, 1);
        assert_eq!(out.probability, 0.8);
        assert_eq!(out.health_score, 52.0);
        assert_eq!(out.features.rpm_rolling_mean, 1500.0);
        assert_eq!(out.features.rpm_rolling_std, 0.0);
    }

    #[tokio::test]
    async fn out_of_range_probability_is_clamped() {
        let p = pipeline(Box::new(Fixed(1.3)), Duration::from_secs(1));
        let out = p.process(Reading::rpm("car-1", 1500.0)).await.unwrap();
        assert_eq!(out.probability, 1.0);
        assert_eq!(out.health_score, 40.0);
    }

    #[tokio::test]
    async fn scoring_failure_keeps_window_update() {
        let p = pipeline(Box::new(Broken), Duration::from_secs(1));
        let err = p.process(Reading::rpm("car-1", 1500.0)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Scoring(_)));
        assert_eq!(p.store().snapshot("car-1").unwrap().0, vec![1500.0]);
    }

    #[tokio::test]
    async fn slow_classifier_times_out() {
        let p = pipeline(Box::new(Slow), Duration::from_millis(20));
        let err = p.process(Reading::rpm("car-1", 1500.0)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(20)));
        assert!(p.store().contains("car-1"));
    }

    #[tokio::test]
    async fn overflowing_rpm_is_a_validation_error() {
        let p = pipeline(Box::new(Fixed(0.2)), Duration::from_secs(1));
        p.process(Reading::rpm("car-1", 1e200)).await.unwrap();
        let err = p.process(Reading::rpm("car-1", -1e200)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(p.store().snapshot("car-1").unwrap().0, vec![1e200]);

        let out = p.process(Reading::rpm("car-1", 1e200)).await.unwrap();
        assert_eq!(out.features.rpm_rolling_std, 0.0);
    }
}
