mod hot_swap;
mod session_lifecycle;
