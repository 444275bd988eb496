mod app_router;
mod handlers;

pub use app_router::AppRouter;
