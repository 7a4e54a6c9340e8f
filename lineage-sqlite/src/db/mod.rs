pub mod blobs;
pub mod connection;
pub mod manifests;
pub mod migrate;
