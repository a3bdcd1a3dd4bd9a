pub mod handler;
pub mod routes;
pub mod transform;
pub mod upstream;
