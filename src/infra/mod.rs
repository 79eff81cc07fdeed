// Infrastructure adapters shared by the provider sources

pub mod http_client;
