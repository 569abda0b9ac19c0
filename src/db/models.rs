use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct CounterRow {
    pub counter_key: String,
    pub count: i64,
}
