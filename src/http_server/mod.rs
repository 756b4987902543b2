pub mod middleware;
pub mod routes;
pub mod server;

pub use middleware::Principal;
pub use server::HttpServer;
