pub mod helpers;
mod tests_iteration;
