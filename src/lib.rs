pub mod cache;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod router;
pub mod state;
pub mod tasks;

pub mod crypto {
    pub mod jwt;
}

pub mod models {
    pub mod claims;
    pub mod context;
    pub mod session;
}

pub mod repositories {
    pub mod memory;
    pub mod session;
}

pub mod services {
    pub mod orchestrator;
    pub mod roles;
    pub mod sessions;
}

pub mod handlers {
    pub mod sessions;
}

pub mod middleware_layer {
    pub mod auth;
    pub mod rate_limit;
}

pub mod validation {
    pub mod session;
}
