use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{OrderStatus, ReservationOutcome};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use crate::error::SeckillError;
use crate::gate::AdmissionGate;
use crate::models::{NewSeckillVoucher, SeckillVoucher};
use crate::repository::OrderRepository;
use crate::stock::StockStore;

/// Set by the gateway once the session has been authenticated.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AdmissionGate>,
    pub stock: Arc<dyn StockStore>,
    pub repository: Arc<dyn OrderRepository>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeckillResponse {
    pub order_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusResponse {
    pub order_id: i64,
    pub voucher_id: i64,
    pub status: OrderStatus,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockResponse {
    pub voucher_id: i64,
    pub stock: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddVoucherResponse {
    pub voucher_id: i64,
    pub seeded: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: message.into() }))
}

fn reject(err: SeckillError) -> ApiError {
    let status = match &err {
        SeckillError::SoldOut
        | SeckillError::AlreadyPurchased
        | SeckillError::NotStarted
        | SeckillError::Ended => StatusCode::CONFLICT,
        SeckillError::VoucherNotFound(_) => StatusCode::NOT_FOUND,
        SeckillError::LockBusy(_) | SeckillError::TransientStoreFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    api_error(status, err.to_string())
}

fn unavailable(err: anyhow::Error) -> ApiError {
    error!(error = %err, "Store unavailable");
    reject(SeckillError::transient(err))
}

/// Id of the authenticated caller.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<i64>().ok())
            .map(CurrentUser)
            .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "not logged in"))
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/voucher-order/seckill/:voucher_id",
            post(seckill_voucher).get(order_status),
        )
        .route("/voucher/seckill", post(add_seckill_voucher))
        .route("/voucher/seckill/:voucher_id/stock", get(remaining_stock))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn seckill_voucher(
    State(state): State<AppState>,
    Path(voucher_id): Path<i64>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<SeckillResponse>, ApiError> {
    let outcome = state.gate.reserve(voucher_id, user_id).await.map_err(|e| {
        error!(voucher_id, user_id, error = %e, "Reservation failed");
        reject(e)
    })?;

    match outcome {
        ReservationOutcome::Reserved { order_id } => Ok(Json(SeckillResponse { order_id })),
        ReservationOutcome::SoldOut => Err(reject(SeckillError::SoldOut)),
        ReservationOutcome::AlreadyPurchased => Err(reject(SeckillError::AlreadyPurchased)),
        ReservationOutcome::NotStarted => Err(reject(SeckillError::NotStarted)),
        ReservationOutcome::Ended => Err(reject(SeckillError::Ended)),
    }
}

/// `persisted` once the order row exists, `pending` while only the fast-store
/// purchase record does. The consumer never rewrites purchase records, so an
/// order the repository rejected (stock exhausted after the fast store was
/// re-seeded) keeps reporting `pending`.
pub async fn order_status(
    State(state): State<AppState>,
    Path(voucher_id): Path<i64>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<OrderStatusResponse>, ApiError> {
    if let Some(order) = state
        .repository
        .find_order(voucher_id, user_id)
        .await
        .map_err(unavailable)?
    {
        return Ok(Json(OrderStatusResponse {
            order_id: order.id,
            voucher_id,
            status: OrderStatus::Persisted,
            created_at: order.created_at,
        }));
    }

    match state
        .stock
        .purchase_of(voucher_id, user_id)
        .await
        .map_err(unavailable)?
    {
        Some(order_id) => Ok(Json(OrderStatusResponse {
            order_id,
            voucher_id,
            status: OrderStatus::Pending,
            created_at: None,
        })),
        None => Err(api_error(StatusCode::NOT_FOUND, "order not found")),
    }
}

pub async fn add_seckill_voucher(
    State(state): State<AppState>,
    Json(voucher): Json<NewSeckillVoucher>,
) -> Result<(StatusCode, Json<AddVoucherResponse>), ApiError> {
    if voucher.stock < 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, "stock must not be negative"));
    }
    if voucher.begin_time >= voucher.end_time {
        return Err(api_error(StatusCode::BAD_REQUEST, "beginTime must be before endTime"));
    }

    let voucher_id = voucher.voucher_id;
    let stock = voucher.stock;
    let window = voucher.window();
    let status = if state
        .repository
        .add_voucher(voucher.clone())
        .await
        .map_err(unavailable)?
    {
        StatusCode::CREATED
    } else {
        // a repeat of the same registration finishes the fast-store side
        match state.repository.find_voucher(voucher_id).await.map_err(unavailable)? {
            Some(existing) if same_voucher(&existing, &voucher) => StatusCode::OK,
            _ => return Err(api_error(StatusCode::CONFLICT, "voucher already exists")),
        }
    };

    let seeded = state
        .stock
        .seed(voucher_id, stock as i64)
        .await
        .map_err(unavailable)?;
    state
        .stock
        .set_window(voucher_id, window)
        .await
        .map_err(unavailable)?;
    info!(voucher_id, stock, seeded, "Seckill voucher added");

    Ok((status, Json(AddVoucherResponse { voucher_id, seeded })))
}

/// Postgres keeps microseconds, so timestamps are compared at that precision.
fn same_voucher(existing: &SeckillVoucher, requested: &NewSeckillVoucher) -> bool {
    existing.stock == requested.stock
        && existing.begin_time.timestamp_micros() == requested.begin_time.timestamp_micros()
        && existing.end_time.timestamp_micros() == requested.end_time.timestamp_micros()
}

pub async fn remaining_stock(
    State(state): State<AppState>,
    Path(voucher_id): Path<i64>,
) -> Result<Json<StockResponse>, ApiError> {
    match state.stock.remaining(voucher_id).await.map_err(unavailable)? {
        Some(stock) => Ok(Json(StockResponse { voucher_id, stock })),
        None => Err(reject(SeckillError::VoucherNotFound(voucher_id))),
    }
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateSettings;
    use crate::id_worker::IdWorker;
    use crate::queue::{MemoryOrderQueue, OrderQueue};
    use crate::repository::MemoryOrderRepository;
    use crate::stock::MemoryStockStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use chrono::Duration;
    use serde::de::DeserializeOwned;
    use crate::models::SaleWindow;
    use shared::{ReserveCode, ORDER_GROUP};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    /// Store whose first `seed` fails as if Redis were unreachable.
    struct SeedFailsOnce {
        failed: AtomicBool,
        inner: MemoryStockStore,
    }

    #[async_trait]
    impl StockStore for SeedFailsOnce {
        async fn seed(&self, voucher_id: i64, stock: i64) -> anyhow::Result<bool> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                anyhow::bail!("connection reset");
            }
            self.inner.seed(voucher_id, stock).await
        }

        async fn set_window(&self, voucher_id: i64, window: SaleWindow) -> anyhow::Result<()> {
            self.inner.set_window(voucher_id, window).await
        }

        async fn reserve(
            &self,
            voucher_id: i64,
            user_id: i64,
            order_id: i64,
            now: DateTime<Utc>,
        ) -> anyhow::Result<ReserveCode> {
            self.inner.reserve(voucher_id, user_id, order_id, now).await
        }

        async fn release(&self, voucher_id: i64, user_id: i64, order_id: i64) -> anyhow::Result<bool> {
            self.inner.release(voucher_id, user_id, order_id).await
        }

        async fn remaining(&self, voucher_id: i64) -> anyhow::Result<Option<i64>> {
            self.inner.remaining(voucher_id).await
        }

        async fn purchase_of(&self, voucher_id: i64, user_id: i64) -> anyhow::Result<Option<i64>> {
            self.inner.purchase_of(voucher_id, user_id).await
        }
    }

    async fn app() -> Router {
        app_with(Arc::new(MemoryStockStore::new())).await
    }

    async fn app_with(stock: Arc<dyn StockStore>) -> Router {
        let queue: Arc<dyn OrderQueue> = Arc::new(MemoryOrderQueue::new());
        queue.create_group(ORDER_GROUP).await.unwrap();
        let gate = Arc::new(AdmissionGate::new(
            stock.clone(),
            queue,
            Arc::new(IdWorker::new(1).unwrap()),
            GateSettings::default(),
        ));
        create_router(AppState {
            gate,
            stock,
            repository: Arc::new(MemoryOrderRepository::new()),
        })
    }

    async fn send(app: &Router, method: Method, uri: &str, user: Option<i64>, body: Option<serde_json::Value>) -> (StatusCode, Vec<u8>) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            request = request.header(USER_HEADER, user.to_string());
        }
        let request = match body {
            Some(json) => request
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn parse<T: DeserializeOwned>(bytes: &[u8]) -> T {
        serde_json::from_slice(bytes).unwrap()
    }

    async fn add_voucher(app: &Router, voucher_id: i64, stock: i32) {
        let now = Utc::now();
        let body = serde_json::json!({
            "voucherId": voucher_id,
            "stock": stock,
            "beginTime": now - Duration::hours(1),
            "endTime": now + Duration::hours(1),
        });
        let (status, _) = send(app, Method::POST, "/voucher/seckill", None, Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    #[tokio::test]
    async fn seckill_returns_order_id_then_rejects_repeat() {
        let app = app().await;
        add_voucher(&app, 1, 5).await;

        let (status, body) = send(&app, Method::POST, "/voucher-order/seckill/1", Some(7), None).await;
        assert_eq!(status, StatusCode::OK);
        let order_id = parse::<SeckillResponse>(&body).order_id;
        assert!(order_id > 0);

        let (status, body) = send(&app, Method::POST, "/voucher-order/seckill/1", Some(7), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(parse::<ErrorResponse>(&body).error, "duplicate order");

        let (_, body) = send(&app, Method::GET, "/voucher/seckill/1/stock", None, None).await;
        assert_eq!(parse::<StockResponse>(&body).stock, 4);
    }

    #[tokio::test]
    async fn sold_out_voucher_is_rejected() {
        let app = app().await;
        add_voucher(&app, 1, 0).await;

        let (status, body) = send(&app, Method::POST, "/voucher-order/seckill/1", Some(7), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(parse::<ErrorResponse>(&body).error, "insufficient stock");
    }

    #[tokio::test]
    async fn anonymous_caller_is_unauthorized() {
        let app = app().await;
        let (status, _) = send(&app, Method::POST, "/voucher-order/seckill/1", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn reserved_order_reports_pending() {
        let app = app().await;
        add_voucher(&app, 1, 5).await;
        let (_, body) = send(&app, Method::POST, "/voucher-order/seckill/1", Some(7), None).await;
        let order_id = parse::<SeckillResponse>(&body).order_id;

        let (status, body) = send(&app, Method::GET, "/voucher-order/seckill/1", Some(7), None).await;
        assert_eq!(status, StatusCode::OK);
        let status_body = parse::<OrderStatusResponse>(&body);
        assert_eq!(status_body.order_id, order_id);
        assert_eq!(status_body.status, OrderStatus::Pending);

        let (status, _) = send(&app, Method::GET, "/voucher-order/seckill/1", Some(8), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn duplicate_or_invalid_voucher_is_refused() {
        let app = app().await;
        add_voucher(&app, 1, 5).await;
        let now = Utc::now();

        let again = serde_json::json!({
            "voucherId": 1, "stock": 5,
            "beginTime": now, "endTime": now + Duration::hours(1),
        });
        let (status, _) = send(&app, Method::POST, "/voucher/seckill", None, Some(again)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let backwards = serde_json::json!({
            "voucherId": 2, "stock": 5,
            "beginTime": now, "endTime": now - Duration::hours(1),
        });
        let (status, _) = send(&app, Method::POST, "/voucher/seckill", None, Some(backwards)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn repeated_registration_after_seed_failure_completes_it() {
        let app = app_with(Arc::new(SeedFailsOnce {
            failed: AtomicBool::new(false),
            inner: MemoryStockStore::new(),
        }))
        .await;
        let now = Utc::now();
        let voucher = serde_json::json!({
            "voucherId": 1, "stock": 5,
            "beginTime": now - Duration::hours(1), "endTime": now + Duration::hours(1),
        });

        let (status, _) = send(&app, Method::POST, "/voucher/seckill", None, Some(voucher.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = send(&app, Method::POST, "/voucher/seckill", None, Some(voucher)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(parse::<AddVoucherResponse>(&body).seeded);

        let (status, _) = send(&app, Method::POST, "/voucher-order/seckill/1", Some(7), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn identical_registration_does_not_reseed() {
        let app = app().await;
        let now = Utc::now();
        let voucher = serde_json::json!({
            "voucherId": 1, "stock": 5,
            "beginTime": now - Duration::hours(1), "endTime": now + Duration::hours(1),
        });
        let (status, _) = send(&app, Method::POST, "/voucher/seckill", None, Some(voucher.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        send(&app, Method::POST, "/voucher-order/seckill/1", Some(7), None).await;

        let (status, body) = send(&app, Method::POST, "/voucher/seckill", None, Some(voucher)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!parse::<AddVoucherResponse>(&body).seeded);

        let (_, body) = send(&app, Method::GET, "/voucher/seckill/1/stock", None, None).await;
        assert_eq!(parse::<StockResponse>(&body).stock, 4);
    }

    #[tokio::test]
    async fn window_not_yet_open_is_rejected() {
        let app = app().await;
        let begin = Utc::now() + Duration::hours(1);
        let voucher = serde_json::json!({
            "voucherId": 1, "stock": 5,
            "beginTime": begin, "endTime": begin + Duration::hours(1),
        });
        send(&app, Method::POST, "/voucher/seckill", None, Some(voucher)).await;

        let (status, body) = send(&app, Method::POST, "/voucher-order/seckill/1", Some(7), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(parse::<ErrorResponse>(&body).error, "seckill has not started");
    }

    #[tokio::test]
    async fn unknown_voucher_stock_is_not_found() {
        let app = app().await;
        let (status, _) = send(&app, Method::GET, "/voucher/seckill/9/stock", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = send(&app, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"OK");
    }
}
