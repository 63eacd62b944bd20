use shared::metrics_defs::{MetricDef, MetricType};

pub const SYNC_RUNS: MetricDef = MetricDef {
    name: "sync.runs",
    metric_type: MetricType::Counter,
    description: "Completed sync runs. Tagged with outcome.",
};

pub const SYNC_DURATION: MetricDef = MetricDef {
    name: "sync.duration",
    metric_type: MetricType::Histogram,
    description: "Wall time of a sync run in seconds. Tagged with outcome.",
};

pub const SYNC_ROWS_INSERTED: MetricDef = MetricDef {
    name: "sync.rows_inserted",
    metric_type: MetricType::Counter,
    description: "Rows accepted by the warehouse. Tagged with table.",
};

pub const UPSTREAM_REQUESTS: MetricDef = MetricDef {
    name: "upstream.requests",
    metric_type: MetricType::Counter,
    description: "Requests sent to the tag manager API. Tagged with endpoint, status.",
};

pub const UPSTREAM_RETRIES: MetricDef = MetricDef {
    name: "upstream.retries",
    metric_type: MetricType::Counter,
    description: "Tag manager API requests retried after a transient status",
};

pub const ALL_METRICS: &[MetricDef] = &[
    SYNC_RUNS,
    SYNC_DURATION,
    SYNC_ROWS_INSERTED,
    UPSTREAM_REQUESTS,
    UPSTREAM_RETRIES,
];
