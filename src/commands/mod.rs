pub mod backtest;
pub mod collect;
pub mod import;
pub mod optimize;
pub mod run;
pub mod trade;
