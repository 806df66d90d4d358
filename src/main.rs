use std::time::{Duration, Instant};

use actix_web::middleware::DefaultHeaders;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use color_eyre::eyre::Result;
use qstring::QString;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kactus::config::Config;
use kactus::fetch::{FeedFetcher, FetchOutcome};
use kactus::static_data::{AgencyRegistry, RouteRegistry};
use kactus::{PositionCache, SharedPositionCache};

const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(30);

struct AppState {
    feed: String,
    cache: SharedPositionCache,
    agencies: Option<AgencyRegistry>,
    routes: Option<RouteRegistry>,
}

#[derive(Serialize)]
struct StatusBody {
    feed: String,
    #[serde(flatten)]
    cache: kactus::CacheStatus,
}

fn json_response<T: Serialize>(value: &T) -> HttpResponse {
    match serde_json::to_string(value) {
        Ok(json) => HttpResponse::Ok()
            .insert_header(("Content-Type", "application/json"))
            .body(json),
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            HttpResponse::InternalServerError()
                .insert_header(("Content-Type", "text/plain"))
                .body(format!("Error: {}\n", e))
        }
    }
}

fn not_loaded(what: &str) -> HttpResponse {
    HttpResponse::NotFound()
        .insert_header(("Content-Type", "text/plain"))
        .body(format!("Error: no {} loaded\n", what))
}

async fn index(_req: HttpRequest) -> impl Responder {
    HttpResponse::Ok()
        .insert_header(("Content-Type", "text/plain"))
        .body("Kactus vehicle position cache\n")
}

async fn gtfsrt(req: HttpRequest, state: web::Data<AppState>) -> impl Responder {
    let (bytes, changed_at) = state.cache.published_feed().await;
    let hash = farmhash::hash64(&bytes);
    let timeofcache = changed_at.map(|at| at.timestamp_millis());

    let qs = QString::from(req.query_string());

    // timeofcache is in milliseconds, compared against the last content change.
    if let (Some(client_time), Some(timeofcache)) = (
        qs.get("timeofcache").and_then(|t| t.parse::<i64>().ok()),
        timeofcache,
    ) {
        if client_time >= timeofcache {
            return HttpResponse::NoContent().finish();
        }
    }

    if qs.get("bodyhash").and_then(|h| h.parse::<u64>().ok()) == Some(hash) {
        return HttpResponse::NoContent().finish();
    }

    let mut response = HttpResponse::Ok();
    response
        .insert_header(("Content-Type", "application/x-google-protobuf"))
        .insert_header(("hash", hash));
    if let Some(timeofcache) = timeofcache {
        response.insert_header(("timeofcache", timeofcache));
    }
    response.body(bytes)
}

async fn vehicles(state: web::Data<AppState>) -> impl Responder {
    json_response(&state.cache.snapshot_view().await)
}

async fn status(state: web::Data<AppState>) -> impl Responder {
    json_response(&StatusBody {
        feed: state.feed.clone(),
        cache: state.cache.status().await,
    })
}

async fn agencies(state: web::Data<AppState>) -> impl Responder {
    match &state.agencies {
        Some(agencies) => json_response(&agencies.all()),
        None => not_loaded("agencies"),
    }
}

async fn routes(state: web::Data<AppState>) -> impl Responder {
    match &state.routes {
        Some(routes) => json_response(&routes.all()),
        None => not_loaded("routes"),
    }
}

fn routes_config(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index))
        .route("/gtfsrt", web::get().to(gtfsrt))
        .route("/gtfsrt/", web::get().to(gtfsrt))
        .route("/vehicles", web::get().to(vehicles))
        .route("/vehicles/", web::get().to(vehicles))
        .route("/status", web::get().to(status))
        .route("/agencies", web::get().to(agencies))
        .route("/routes", web::get().to(routes));
}

/// Fetch, merge and purge, forever. Waits out HTTP 429 before trying again.
async fn poll_loop(mut fetcher: FeedFetcher, cache: SharedPositionCache, interval: Duration) {
    loop {
        let started = Instant::now();

        match fetcher.poll().await {
            Ok(FetchOutcome::Updated(feed)) => match cache.ingest(feed.entities).await {
                Ok(changes) => info!(
                    changed = changes.len(),
                    stale = changes.stale,
                    superseded = changes.superseded,
                    rejected = changes.rejected.len(),
                    "ingested feed"
                ),
                Err(e) => error!(error = %e, "feed rejected"),
            },
            Ok(FetchOutcome::NotModified) | Ok(FetchOutcome::Unchanged) => {}
            Err(e) if e.is_rate_limited() => {
                warn!(backoff = ?RATE_LIMIT_BACKOFF, "rate limited by feed");
                tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
            }
            Err(e) => warn!(error = %e, "poll failed"),
        }

        let purged = cache.purge_stale(None).await;
        if purged > 0 {
            info!(purged, "purged stale vehicles");
        }

        let elapsed = started.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let agencies = config
        .agencies
        .as_ref()
        .map(AgencyRegistry::from_path)
        .transpose()?;

    let routes = match (&config.routes, &agencies) {
        (Some(path), Some(agencies)) => Some(RouteRegistry::from_path(agencies, path)?),
        _ => None,
    };

    let cache = SharedPositionCache::new(
        PositionCache::new(config.stale_window).with_label(config.source.url.clone()),
    );

    let fetcher = FeedFetcher::new(config.source.clone())?;
    actix_web::rt::spawn(poll_loop(fetcher, cache.clone(), config.interval));

    let state = web::Data::new(AppState {
        feed: config.source.url.clone(),
        cache,
        agencies,
        routes,
    });

    info!(bind = %config.bind, feed = %config.source.url, "starting server");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(
                DefaultHeaders::new()
                    .add(("Server", "Kactus"))
                    .add(("Access-Control-Allow-Origin", "*"))
                    .add((
                        "Access-Control-Expose-Headers",
                        "Server, hash, server, Hash, timeofcache",
                    )),
            )
            .wrap(actix_block_ai_crawling::BlockAi)
            .configure(routes_config)
    })
    .workers(4)
    .bind(&config.bind)?
    .run()
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use actix_web::test;
    use chrono::{Duration as ChronoDuration, Utc};
    use kactus::model::VehicleUpdate;
    use kactus::FeedEntity;

    async fn state_with_bus() -> web::Data<AppState> {
        let cache = SharedPositionCache::new(PositionCache::new(ChronoDuration::minutes(60)));
        cache
            .ingest(vec![FeedEntity::Vehicle(VehicleUpdate {
                entity_id: "1".to_string(),
                vehicle_id: Some("bus-1".to_string()),
                timestamp: Some(Utc::now().timestamp() as u64),
                ..Default::default()
            })])
            .await
            .unwrap();

        web::Data::new(AppState {
            feed: "https://example.org/vp.pb".to_string(),
            cache,
            agencies: None,
            routes: None,
        })
    }

    #[actix_web::test]
    async fn gtfsrt_honours_body_hash() {
        let app = test::init_service(
            App::new()
                .app_data(state_with_bus().await)
                .configure(routes_config),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/gtfsrt").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let hash = resp.headers().get("hash").unwrap().to_str().unwrap().to_string();

        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/gtfsrt?bodyhash={hash}"))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/gtfsrt?bodyhash=1").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn gtfsrt_honours_time_of_cache() {
        let app = test::init_service(
            App::new()
                .app_data(state_with_bus().await)
                .configure(routes_config),
        )
        .await;

        let later = Utc::now().timestamp_millis() + 60_000;
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/gtfsrt?timeofcache={later}"))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri("/gtfsrt?timeofcache=0").to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn purge_invalidates_time_of_cache() {
        let cache = SharedPositionCache::new(PositionCache::new(ChronoDuration::minutes(60)));
        let ingested_at = Utc::now() - ChronoDuration::minutes(10);
        cache
            .ingest_at(
                vec![FeedEntity::Vehicle(VehicleUpdate {
                    entity_id: "1".to_string(),
                    vehicle_id: Some("bus-1".to_string()),
                    timestamp: Some(ingested_at.timestamp() as u64),
                    ..Default::default()
                })],
                ingested_at,
            )
            .await
            .unwrap();

        let state = web::Data::new(AppState {
            feed: "https://example.org/vp.pb".to_string(),
            cache: cache.clone(),
            agencies: None,
            routes: None,
        });
        let app = test::init_service(App::new().app_data(state).configure(routes_config)).await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/gtfsrt").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let stamp = resp.headers().get("timeofcache").unwrap().to_str().unwrap().to_string();
        assert_eq!(stamp, ingested_at.timestamp_millis().to_string());

        let uri = format!("/gtfsrt?timeofcache={stamp}");
        let resp = test::call_service(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        // The feed stalls, but the vehicle ages out.
        assert_eq!(cache.purge_stale(Some(Utc::now())).await, 1);

        let resp = test::call_service(&app, test::TestRequest::get().uri(&uri).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        let feed = kactus::decode_feed(&body).unwrap();
        assert!(feed.entities.is_empty());
    }

    #[actix_web::test]
    async fn vehicles_and_status_render_json() {
        let app = test::init_service(
            App::new()
                .app_data(state_with_bus().await)
                .configure(routes_config),
        )
        .await;

        let body: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/vehicles").to_request(),
        )
        .await;
        assert_eq!(body[0]["vehicleId"], "bus-1");

        let body: serde_json::Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/status").to_request(),
        )
        .await;
        assert_eq!(body["vehicles"], 1);
        assert_eq!(body["stale_window_secs"], 3600);

        let resp = test::call_service(&app, test::TestRequest::get().uri("/routes").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
