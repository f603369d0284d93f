use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use coco::{
    Config, ConnContext, Connection, EchoHandler, Frame, Handler, HandlerError, Listener, Server,
    ServerError, Transport,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

fn config() -> Config {
    Config::default()
        .with_shutdown_timeout(Duration::from_secs(2))
        .with_retry_delay(Duration::from_millis(10))
}

async fn serve_echo(
    server: &Server,
) -> (
    String,
    Arc<EchoHandler>,
    JoinHandle<Result<(), ServerError>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handler = Arc::new(EchoHandler::new());

    let task = tokio::spawn({
        let server = server.clone();
        let handler = Arc::clone(&handler);
        async move { server.serve(listener, handler).await }
    });

    (addr, handler, task)
}

async fn connect(addr: &str) -> Connection {
    Connection::new(TcpStream::connect(addr).await.unwrap())
}

async fn wait_until(mut f: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !f() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A listener that fails with `TimedOut` a fixed number of times and then never yields again.
struct TimeoutListener {
    timeouts: usize,
    transport: Transport,
    dropped: Arc<AtomicBool>,
}

impl TimeoutListener {
    fn new(timeouts: usize) -> Self {
        Self {
            timeouts,
            transport: Transport::Tcp,
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Drop for TimeoutListener {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

impl Listener for TimeoutListener {
    type Conn = TcpStream;

    fn transport(&self) -> Transport {
        self.transport
    }

    fn local_addr(&self) -> io::Result<String> {
        Ok("fake:0".to_string())
    }

    fn accept(
        &mut self,
    ) -> impl std::future::Future<Output = io::Result<(TcpStream, String)>> + Send {
        async move {
            if self.timeouts == 0 {
                return std::future::pending::<io::Result<(TcpStream, String)>>().await;
            }
            self.timeouts -= 1;
            Err(io::Error::new(io::ErrorKind::TimedOut, "accept timed out"))
        }
    }
}

/// A handler whose `close` always fails.
#[derive(Default)]
struct FailingHandler {
    closed: AtomicUsize,
}

impl Handler<TcpStream> for FailingHandler {
    fn handle(
        &self,
        _ctx: ConnContext,
        _conn: TcpStream,
    ) -> impl std::future::Future<Output = ()> + Send {
        async {}
    }

    fn close(&self) -> Result<(), HandlerError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Io(io::Error::new(
            io::ErrorKind::Other,
            "close failed",
        )))
    }
}

#[tokio::test]
async fn echo_round_trip() {
    let server = Server::new(config()).unwrap();
    let (addr, _handler, task) = serve_echo(&server).await;

    let mut conn = connect(&addr).await;
    let frames = vec![
        Frame::Array(vec![Frame::from("SET"), Frame::from("key"), Frame::from("value")]),
        Frame::Simple("hi".to_string()),
        Frame::Bulk(Bytes::new()),
        Frame::NullBulk,
        Frame::NullArray,
        Frame::Integer(-5),
    ];

    for frame in &frames {
        conn.write_frame(frame).await.unwrap();
    }
    for frame in &frames {
        assert_eq!(conn.read_frame().await.unwrap().as_ref(), Some(frame));
    }

    assert_eq!(server.connections(), 1);
    drop(conn);
    wait_until(|| server.connections() == 0).await;

    server.shutdown().await.unwrap();
    assert!(matches!(task.await.unwrap(), Err(ServerError::Stopped)));
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let server = Server::new(config()).unwrap();
    let (addr, handler, task) = serve_echo(&server).await;

    let mut conn = connect(&addr).await;
    conn.write_frame(&Frame::Integer(1)).await.unwrap();
    assert_eq!(conn.read_frame().await.unwrap(), Some(Frame::Integer(1)));

    server.shutdown().await.unwrap();

    assert!(matches!(task.await.unwrap(), Err(ServerError::Stopped)));
    assert_eq!(conn.read_frame().await.unwrap(), None);
    wait_until(|| handler.connections() == 0).await;
    assert!(TcpStream::connect(&addr).await.is_err());
}

#[tokio::test]
async fn shutdown_twice_is_stopped() {
    let server = Server::new(config()).unwrap();
    let (_addr, _handler, task) = serve_echo(&server).await;
    wait_until(|| server.listeners() == 1).await;

    assert!(server.shutdown().await.is_ok());
    assert!(matches!(server.shutdown().await, Err(ServerError::Stopped)));
    assert!(matches!(task.await.unwrap(), Err(ServerError::Stopped)));
}

#[tokio::test]
async fn serve_after_shutdown_is_stopped() {
    let server = Server::new(config()).unwrap();
    server.shutdown().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let result = server.serve(listener, Arc::new(EchoHandler::new())).await;

    assert!(matches!(result, Err(ServerError::Stopped)));
    assert_eq!(server.listeners(), 0);
}

#[tokio::test]
async fn unsupported_transport_closes_listener_and_handler() {
    let server = Server::new(config()).unwrap();
    let mut listener = TimeoutListener::new(0);
    listener.transport = Transport::Unix;
    let dropped = Arc::clone(&listener.dropped);
    let handler = Arc::new(EchoHandler::new());

    let result = server.serve(listener, Arc::clone(&handler)).await;

    assert!(matches!(
        result,
        Err(ServerError::UnsupportedProtocol(Transport::Unix))
    ));
    assert!(dropped.load(Ordering::SeqCst));
    assert!(matches!(handler.close(), Err(HandlerError::AlreadyClosed)));
    assert_eq!(server.listeners(), 0);
}

/// A listener whose socket is gone: its local address cannot be resolved.
struct BrokenListener;

impl Listener for BrokenListener {
    type Conn = TcpStream;

    fn transport(&self) -> Transport {
        Transport::Tcp
    }

    fn local_addr(&self) -> io::Result<String> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"))
    }

    fn accept(
        &mut self,
    ) -> impl std::future::Future<Output = io::Result<(TcpStream, String)>> + Send {
        std::future::pending::<io::Result<(TcpStream, String)>>()
    }
}

#[tokio::test]
async fn invalid_listener_is_rejected() {
    let server = Server::new(config()).unwrap();
    let handler = Arc::new(EchoHandler::new());

    let result = server.serve(BrokenListener, Arc::clone(&handler)).await;

    assert!(matches!(result, Err(ServerError::InvalidListener(_))));
    assert_eq!(server.listeners(), 0);
    // Rejected before anything is started, the handler is left alone.
    assert!(handler.close().is_ok());
}

#[cfg(unix)]
#[tokio::test]
async fn unix_listener_is_rejected() {
    let path = std::env::temp_dir().join(format!("coco-{}.sock", uuid::Uuid::new_v4()));
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    let server = Server::new(config()).unwrap();

    let result = server.serve(listener, Arc::new(EchoHandler::new())).await;

    assert!(matches!(
        result,
        Err(ServerError::UnsupportedProtocol(Transport::Unix))
    ));
    assert!(tokio::net::UnixStream::connect(&path).await.is_err());
    let _ = std::fs::remove_file(&path);
}

#[tokio::test(start_paused = true)]
async fn accept_retries_five_timeouts() {
    let server = Server::new(config()).unwrap();
    let task = tokio::spawn({
        let server = server.clone();
        async move {
            server
                .serve(TimeoutListener::new(5), Arc::new(EchoHandler::new()))
                .await
        }
    });

    sleep(Duration::from_secs(60)).await;
    assert!(!task.is_finished());
    assert_eq!(server.listeners(), 1);

    server.shutdown().await.unwrap();
    assert!(matches!(task.await.unwrap(), Err(ServerError::Stopped)));
}

#[tokio::test(start_paused = true)]
async fn accept_sixth_timeout_is_returned() {
    let server = Server::new(config()).unwrap();

    let result = server
        .serve(TimeoutListener::new(6), Arc::new(EchoHandler::new()))
        .await;

    match result {
        Err(ServerError::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::TimedOut),
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(server.listeners(), 0);
}

#[tokio::test]
async fn failing_listener_leaves_others_running() {
    let server = Server::new(config()).unwrap();
    let (addr, _handler, task) = serve_echo(&server).await;

    let result = server
        .serve(TimeoutListener::new(6), Arc::new(EchoHandler::new()))
        .await;
    assert!(matches!(result, Err(ServerError::Io(_))));

    let mut conn = connect(&addr).await;
    conn.write_frame(&Frame::Simple("still up".to_string()))
        .await
        .unwrap();
    assert_eq!(
        conn.read_frame().await.unwrap(),
        Some(Frame::Simple("still up".to_string()))
    );

    server.shutdown().await.unwrap();
    assert!(matches!(task.await.unwrap(), Err(ServerError::Stopped)));
}

#[tokio::test]
async fn shutdown_aggregates_close_errors() {
    let server = Server::new(config()).unwrap();
    let first = Arc::new(FailingHandler::default());
    let second = Arc::new(FailingHandler::default());

    let mut tasks = Vec::new();
    for handler in [&first, &second] {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = server.clone();
        let handler = Arc::clone(handler);
        tasks.push(tokio::spawn(
            async move { server.serve(listener, handler).await },
        ));
    }
    wait_until(|| server.listeners() == 2).await;

    match server.shutdown().await {
        Err(ServerError::Close(errors)) => assert_eq!(errors.len(), 2),
        other => panic!("unexpected result: {:?}", other),
    }

    // Every listener is stopped even though every handler failed to close.
    for task in tasks {
        assert!(matches!(task.await.unwrap(), Err(ServerError::Stopped)));
    }
    assert_eq!(first.closed.load(Ordering::SeqCst), 1);
    assert_eq!(second.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refuses_connections_over_the_limit() {
    let server = Server::new(config().with_max_connections(1)).unwrap();
    let (addr, _handler, task) = serve_echo(&server).await;

    let mut first = connect(&addr).await;
    first.write_frame(&Frame::Integer(1)).await.unwrap();
    assert_eq!(first.read_frame().await.unwrap(), Some(Frame::Integer(1)));

    // Accepted by the kernel, then dropped by the server.
    let mut second = connect(&addr).await;
    let refused = second.read_frame().await;
    assert!(matches!(refused, Ok(None) | Err(_)));
    assert_eq!(server.connections(), 1);

    drop(first);
    wait_until(|| server.connections() == 0).await;

    let mut third = connect(&addr).await;
    third.write_frame(&Frame::Integer(3)).await.unwrap();
    assert_eq!(third.read_frame().await.unwrap(), Some(Frame::Integer(3)));

    server.shutdown().await.unwrap();
    assert!(matches!(task.await.unwrap(), Err(ServerError::Stopped)));
}

/// Accept loops only report completion once their listener is gone, so a listener that takes
/// too long to close turns the shutdown into a timeout.
struct SlowDropListener(TimeoutListener);

impl Drop for SlowDropListener {
    fn drop(&mut self) {
        std::thread::sleep(Duration::from_millis(500));
    }
}

impl Listener for SlowDropListener {
    type Conn = TcpStream;

    fn transport(&self) -> Transport {
        self.0.transport()
    }

    fn local_addr(&self) -> io::Result<String> {
        self.0.local_addr()
    }

    fn accept(
        &mut self,
    ) -> impl std::future::Future<Output = io::Result<(TcpStream, String)>> + Send {
        self.0.accept()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_times_out_when_loops_linger() {
    let server = Server::new(
        Config::default().with_shutdown_timeout(Duration::from_millis(50)),
    )
    .unwrap();
    let task = tokio::spawn({
        let server = server.clone();
        async move {
            server
                .serve(
                    SlowDropListener(TimeoutListener::new(0)),
                    Arc::new(EchoHandler::new()),
                )
                .await
        }
    });
    wait_until(|| server.listeners() == 1).await;

    assert!(matches!(
        server.shutdown().await,
        Err(ServerError::ShutdownTimeout)
    ));
    assert!(matches!(task.await.unwrap(), Err(ServerError::Stopped)));
}
