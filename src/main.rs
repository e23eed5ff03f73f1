use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

use edgecore::protocol::Response;
use edgecore::router::Router;
use edgecore::server::{Config, Server};

fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut router = Router::new();
    router.get("/hello", |_| {
        let mut response = Response::new();
        response.set_status(200, "");
        response.set_content_type("text/plain");
        response.set_body(&b"Hello, World!"[..]);
        response
    });
    router.get("/status", |_| Response::make_json(200, &br#"{"status":"ok"}"#[..]));
    router.get("/users/[0-9]+", |request| {
        Response::make_html(200, format!("<html><body>user {}</body></html>", request.path()))
    });

    let server = match Server::builder().config(Config::default()).router(router).build() {
        Ok(server) => server,
        Err(e) => {
            error!(cause = %e, "failed to build server");
            return;
        }
    };

    if let Err(e) = server.start() {
        error!(cause = %e, "failed to start server");
        return;
    }
    server.wait();
}
