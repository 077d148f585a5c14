//! One dashboard refresh: extraction, cost model, panels and rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cost::{CostBreakdown, CostParameters, DailyCostStats};
use crate::panels::{QueryAnalysis, WarehouseSummary};
use crate::recommend::{MetricsBundle, Recommendation, RecommendationRuleEngine};
use crate::telemetry::{
    LookbackDays, QueryDescriptor, QueryKind, TelemetryClient, TelemetryFrame,
};

/// A panel whose extraction failed and was shown empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelError {
    pub kind: QueryKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub warehouse: String,
    pub lookback_days: u32,
    pub generated_at: DateTime<Utc>,
    pub cost_parameters: CostParameters,
    pub warehouse_summary: Option<WarehouseSummary>,
    pub cost_breakdown: CostBreakdown,
    pub daily_cost: Option<DailyCostStats>,
    pub query_analysis: Option<QueryAnalysis>,
    pub recommendations: Vec<Recommendation>,
    pub panel_errors: Vec<PanelError>,
    pub frames: Vec<TelemetryFrame>,
}

impl RefreshReport {
    pub fn frame(&self, kind: QueryKind) -> Option<&TelemetryFrame> {
        self.frames.iter().find(|frame| frame.kind == kind)
    }

    pub fn is_degraded(&self) -> bool {
        !self.panel_errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationsReport {
    pub warehouse: String,
    pub lookback_days: u32,
    pub recommendations: Vec<Recommendation>,
    pub panel_errors: Vec<PanelError>,
}

/// Owns the extraction client and rule engine for every dashboard session.
pub struct DashboardService {
    telemetry: TelemetryClient,
    engine: RecommendationRuleEngine,
}

impl DashboardService {
    pub fn new(telemetry: TelemetryClient, engine: RecommendationRuleEngine) -> Self {
        Self { telemetry, engine }
    }

    pub fn telemetry(&self) -> &TelemetryClient {
        &self.telemetry
    }

    pub fn warehouse(&self) -> &str {
        &self.telemetry.target().warehouse
    }

    pub fn refresh(&self, lookback: LookbackDays) -> RefreshReport {
        let mut panel_errors = Vec::new();

        let params_frame = self.fetch_or_empty(QueryKind::CostParameters, lookback, &mut panel_errors);
        let cost_parameters = CostParameters::from_frame(&params_frame);

        let metrics = self.fetch_or_empty(QueryKind::WarehouseMetrics, lookback, &mut panel_errors);
        let load = self.fetch_or_empty(QueryKind::WarehouseLoad, lookback, &mut panel_errors);
        let cost = self.fetch_or_empty(QueryKind::CostByWorkload, lookback, &mut panel_errors);
        let perf = self.fetch_or_empty(QueryKind::QueryPerformance, lookback, &mut panel_errors);
        let daily = self.fetch_or_empty(QueryKind::DailyCost, lookback, &mut panel_errors);

        let recommendations = self.engine.evaluate(&MetricsBundle {
            warehouse_name: self.warehouse(),
            warehouse_load: &load,
            warehouse_metrics: &metrics,
            query_performance: &perf,
            cost_by_workload: &cost,
        });

        let report = RefreshReport {
            warehouse: self.warehouse().to_string(),
            lookback_days: lookback.days(),
            generated_at: Utc::now(),
            warehouse_summary: WarehouseSummary::from_frames(&metrics, &load, &cost_parameters),
            cost_breakdown: CostBreakdown::from_frame(&cost, &cost_parameters),
            daily_cost: DailyCostStats::from_frame(&daily, &cost_parameters),
            query_analysis: QueryAnalysis::from_frame(&perf),
            cost_parameters,
            recommendations,
            panel_errors,
            frames: vec![params_frame, metrics, load, cost, perf, daily],
        };

        info!(
            component = "refresh",
            event = "refresh.completed",
            warehouse = %report.warehouse,
            lookback_days = report.lookback_days,
            recommendations = report.recommendations.len(),
            degraded_panels = report.panel_errors.len()
        );
        report
    }

    /// Runs only the extractions the rules read.
    pub fn recommendations(&self, lookback: LookbackDays) -> RecommendationsReport {
        let mut panel_errors = Vec::new();
        let metrics = self.fetch_or_empty(QueryKind::WarehouseMetrics, lookback, &mut panel_errors);
        let load = self.fetch_or_empty(QueryKind::WarehouseLoad, lookback, &mut panel_errors);
        let cost = self.fetch_or_empty(QueryKind::CostByWorkload, lookback, &mut panel_errors);
        let perf = self.fetch_or_empty(QueryKind::QueryPerformance, lookback, &mut panel_errors);

        let recommendations = self.engine.evaluate(&MetricsBundle {
            warehouse_name: self.warehouse(),
            warehouse_load: &load,
            warehouse_metrics: &metrics,
            query_performance: &perf,
            cost_by_workload: &cost,
        });

        RecommendationsReport {
            warehouse: self.warehouse().to_string(),
            lookback_days: lookback.days(),
            recommendations,
            panel_errors,
        }
    }

    fn fetch_or_empty(
        &self,
        kind: QueryKind,
        lookback: LookbackDays,
        panel_errors: &mut Vec<PanelError>,
    ) -> TelemetryFrame {
        match self.telemetry.fetch(QueryDescriptor::new(kind, lookback)) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    component = "refresh",
                    event = "refresh.panel.degraded",
                    kind = %kind,
                    lookback_days = lookback.days(),
                    error = %err
                );
                panel_errors.push(PanelError {
                    kind,
                    message: err.to_string(),
                });
                TelemetryFrame::empty(kind, lookback)
            }
        }
    }
}
