pub mod client;

pub use client::HttpChartRenderer;
