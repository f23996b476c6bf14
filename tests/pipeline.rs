use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kraken_cache_proxy::http::{Request, Response, StatusCode};
use kraken_cache_proxy::proxy::{CACHED_HEADER, ProxyError, ProxyPipeline, cache_key};
use kraken_cache_proxy::upstream::{Upstream, UpstreamError, UpstreamFuture, UpstreamResponse};
use kraken_cache_proxy::CacheStore;
use tokio::sync::Barrier;

const TICKER: &[u8] = b"GET /0/public/Ticker?pair=XBTUSD HTTP/1.1\r\nHost: localhost\r\n\r\n";
const TICKER_BODY: &str = r#"{"result":{"XXBTZUSD":{"c":["50000.0","0.01"]}}}"#;

enum Behavior {
    Respond(UpstreamResponse),
    Hang,
    InvalidMethod,
    ClientTimeout,
    WaitFor(Arc<Barrier>, UpstreamResponse),
}

struct FakeUpstream {
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
    targets: Mutex<Vec<String>>,
}

impl FakeUpstream {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            targets: Mutex::new(Vec::new()),
        })
    }

    fn json(body: &str) -> Arc<Self> {
        Self::new(Behavior::Respond(UpstreamResponse::json(body.to_owned())))
    }

    fn set(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Upstream for FakeUpstream {
    fn forward<'a>(&'a self, request: &'a Request) -> UpstreamFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().unwrap().push(request.target().to_owned());

        enum Next {
            Ready(Result<UpstreamResponse, UpstreamError>),
            Hang,
            Wait(Arc<Barrier>, UpstreamResponse),
        }
        let next = match &*self.behavior.lock().unwrap() {
            Behavior::Respond(response) => Next::Ready(Ok(response.clone())),
            Behavior::Hang => Next::Hang,
            Behavior::InvalidMethod => {
                Next::Ready(Err(UpstreamError::InvalidMethod("BREW".to_owned())))
            }
            Behavior::ClientTimeout => Next::Ready(Err(UpstreamError::Timeout)),
            Behavior::WaitFor(barrier, response) => Next::Wait(Arc::clone(barrier), response.clone()),
        };

        Box::pin(async move {
            match next {
                Next::Ready(result) => result,
                Next::Hang => std::future::pending().await,
                Next::Wait(barrier, response) => {
                    barrier.wait().await;
                    Ok(response)
                }
            }
        })
    }
}

fn pipeline(upstream: &Arc<FakeUpstream>) -> ProxyPipeline {
    let upstream: Arc<dyn Upstream> = upstream.clone();
    ProxyPipeline::new(Arc::new(CacheStore::new()), upstream)
}

fn request(raw: &[u8]) -> Request {
    Request::parse(raw).unwrap().0
}

fn body(response: &Response) -> &str {
    std::str::from_utf8(response.payload()).unwrap()
}

fn is_cached(response: &Response) -> bool {
    response.headers().get(CACHED_HEADER) == Some("true")
}

#[tokio::test(start_paused = true)]
async fn ticker_miss_then_hit() {
    let upstream = FakeUpstream::json(TICKER_BODY);
    let proxy = pipeline(&upstream);

    let first = proxy.handle(request(TICKER)).await;
    assert_eq!(first.status(), StatusCode::Ok);
    assert_eq!(body(&first), TICKER_BODY);
    assert!(!first.headers().contains(CACHED_HEADER));
    assert_eq!(first.headers().get("content-type"), Some("application/json"));
    assert_eq!(upstream.calls(), 1);

    tokio::time::advance(Duration::from_secs(10)).await;

    let second = proxy.handle(request(TICKER)).await;
    assert_eq!(second.status(), StatusCode::Ok);
    assert_eq!(body(&second), TICKER_BODY);
    assert!(is_cached(&second));
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn hits_never_reach_upstream() {
    let upstream = FakeUpstream::json(TICKER_BODY);
    let proxy = pipeline(&upstream);
    proxy.handle(request(TICKER)).await;

    // Even an upstream that would hang is never consulted while the entry is live.
    upstream.set(Behavior::Hang);
    for _ in 0..20 {
        let response = proxy.handle(request(TICKER)).await;
        assert!(is_cached(&response));
        tokio::time::advance(Duration::from_secs(1)).await;
    }
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn refetches_after_expiry() {
    let upstream = FakeUpstream::json(TICKER_BODY);
    let proxy = pipeline(&upstream);
    proxy.handle(request(TICKER)).await;

    tokio::time::advance(Duration::from_secs(31)).await;
    let fresh = r#"{"result":{"XXBTZUSD":{"c":["51000.0","0.02"]}}}"#;
    upstream.set(Behavior::Respond(UpstreamResponse::json(fresh)));

    let response = proxy.handle(request(TICKER)).await;
    assert_eq!(body(&response), fresh);
    assert!(!is_cached(&response));
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn expired_exactly_after_ttl() {
    let upstream = FakeUpstream::json(TICKER_BODY);
    let proxy = pipeline(&upstream);
    proxy.handle(request(TICKER)).await;

    let key = cache_key("/0/public/Ticker", Some("pair=XBTUSD"));
    tokio::time::advance(Duration::from_millis(30_000)).await;
    assert_eq!(proxy.cache().get(&key), None);
}

#[tokio::test(start_paused = true)]
async fn upstream_timeout_is_504_and_not_cached() {
    let upstream = FakeUpstream::new(Behavior::Hang);
    let proxy = pipeline(&upstream);

    let err = proxy.try_handle(&request(TICKER)).await.unwrap_err();
    assert!(matches!(err, ProxyError::UpstreamTimeout(d) if d == Duration::from_secs(5)));

    let response = proxy.handle(request(TICKER)).await;
    assert_eq!(response.status(), StatusCode::GatewayTimeout);
    assert!(proxy.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn client_reported_timeout_is_504() {
    let upstream = FakeUpstream::new(Behavior::ClientTimeout);
    let proxy = pipeline(&upstream);

    let response = proxy.handle(request(TICKER)).await;
    assert_eq!(response.status(), StatusCode::GatewayTimeout);
    assert!(proxy.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn upstream_failure_is_502_and_not_retried() {
    let upstream = FakeUpstream::new(Behavior::InvalidMethod);
    let proxy = pipeline(&upstream);

    let response = proxy.handle(request(TICKER)).await;
    assert_eq!(response.status(), StatusCode::BadGateway);
    assert_eq!(upstream.calls(), 1);
    assert!(proxy.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_json_is_502_and_not_cached() {
    let upstream = FakeUpstream::json("<html>maintenance</html>");
    let proxy = pipeline(&upstream);

    let err = proxy.try_handle(&request(TICKER)).await.unwrap_err();
    assert!(matches!(err, ProxyError::Decode(_)));

    let response = proxy.handle(request(TICKER)).await;
    assert_eq!(response.status(), StatusCode::BadGateway);
    assert!(proxy.cache().is_empty());
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn body_is_canonical_json() {
    let upstream = FakeUpstream::json("{ \"result\" : { \"b\": 2, \"a\": [1, 2.5, null] } }\n");
    let proxy = pipeline(&upstream);

    let first = proxy.handle(request(TICKER)).await;
    let second = proxy.handle(request(TICKER)).await;
    assert_eq!(body(&first), r#"{"result":{"a":[1,2.5,null],"b":2}}"#);
    assert_eq!(first.payload(), second.payload());
    assert!(is_cached(&second));
}

#[tokio::test(start_paused = true)]
async fn non_get_bypasses_cache() {
    let upstream = FakeUpstream::new(Behavior::Respond(UpstreamResponse {
        status: 201,
        content_type: Some("text/plain".to_owned()),
        body: "created".into(),
    }));
    let proxy = pipeline(&upstream);
    let post = b"POST /0/public/Ticker?pair=XBTUSD HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}";

    for _ in 0..2 {
        let response = proxy.handle(request(post)).await;
        assert_eq!(response.status(), StatusCode::Created);
        assert_eq!(body(&response), "created");
        assert_eq!(response.headers().get("content-type"), Some("text/plain"));
        assert!(!is_cached(&response));
    }
    assert_eq!(upstream.calls(), 2);
    assert!(proxy.cache().is_empty());

    // A GET to the same target is still a miss.
    upstream.set(Behavior::Respond(UpstreamResponse::json(TICKER_BODY)));
    let response = proxy.handle(request(TICKER)).await;
    assert!(!is_cached(&response));
    assert_eq!(upstream.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn kraken_error_envelope_not_cached() {
    let upstream = FakeUpstream::json(r#"{"error":["EQuery:Unknown asset pair"]}"#);
    let proxy = pipeline(&upstream);

    let response = proxy.handle(request(TICKER)).await;
    assert_eq!(response.status(), StatusCode::Ok);
    assert_eq!(body(&response), r#"{"error":["EQuery:Unknown asset pair"]}"#);
    assert!(proxy.cache().is_empty());

    proxy.handle(request(TICKER)).await;
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn error_status_relayed_not_cached() {
    let upstream = FakeUpstream::new(Behavior::Respond(UpstreamResponse {
        status: 503,
        content_type: Some("application/json".to_owned()),
        body: r#"{"error":["EService:Unavailable"]}"#.into(),
    }));
    let proxy = pipeline(&upstream);

    let response = proxy.handle(request(TICKER)).await;
    assert_eq!(response.status(), StatusCode::ServiceUnavailable);
    assert!(proxy.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn distinct_queries_are_distinct_entries() {
    let upstream = FakeUpstream::json(TICKER_BODY);
    let proxy = pipeline(&upstream);

    proxy.handle(request(TICKER)).await;
    proxy
        .handle(request(b"GET /0/public/Ticker?pair=ETHUSD HTTP/1.1\r\n\r\n"))
        .await;
    assert_eq!(upstream.calls(), 2);
    assert_eq!(proxy.cache().len(), 2);
    assert_eq!(
        *upstream.targets.lock().unwrap(),
        vec![
            "/0/public/Ticker?pair=XBTUSD".to_owned(),
            "/0/public/Ticker?pair=ETHUSD".to_owned(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_misses_are_not_coalesced() {
    let barrier = Arc::new(Barrier::new(2));
    let upstream = FakeUpstream::new(Behavior::WaitFor(
        barrier,
        UpstreamResponse::json(TICKER_BODY),
    ));
    let proxy = pipeline(&upstream);

    // Each call blocks until both have reached the upstream.
    let (a, b) = tokio::join!(proxy.handle(request(TICKER)), proxy.handle(request(TICKER)));
    assert_eq!(upstream.calls(), 2);
    assert!(!is_cached(&a));
    assert!(!is_cached(&b));
    assert_eq!(proxy.cache().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn non_path_targets_are_rejected() {
    let upstream = FakeUpstream::json(TICKER_BODY);
    let proxy = pipeline(&upstream);
    let raws: [&[u8]; 4] = [
        b"GET http://evil.example/0/public/Ticker HTTP/1.1\r\n\r\n",
        b"GET @evil.example/0/public/Ticker HTTP/1.1\r\n\r\n",
        b"OPTIONS * HTTP/1.1\r\n\r\n",
        b"POST https://evil.example/steal HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}",
    ];

    for raw in raws {
        let err = proxy.try_handle(&request(raw)).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidTarget(_)), "{err:?}");

        let response = proxy.handle(request(raw)).await;
        assert_eq!(response.status(), StatusCode::BadRequest);
    }
    assert_eq!(upstream.calls(), 0);
    assert!(proxy.cache().is_empty());
}
