pub mod stop_signal;

pub use stop_signal::{stop_signal, StopHandle, StopSignal};
