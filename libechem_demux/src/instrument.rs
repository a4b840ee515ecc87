use super::error::ConnectionError;
use super::sample::Sample;
use super::technique::TechniqueDescriptor;

/// Pull-based stream of samples for one submitted technique list.
///
/// Samples arrive in strict arrival order. An `Err` item means the connection dropped; the
/// stream yields nothing useful after it.
pub type SampleStream<'a> = Box<dyn Iterator<Item = Result<Sample, ConnectionError>> + 'a>;

/// An open channel on the potentiostat
pub trait InstrumentConnection {
    /// Submit the technique list and start streaming its samples
    fn run_techniques(
        &mut self,
        techniques: &[TechniqueDescriptor],
    ) -> Result<SampleStream<'_>, ConnectionError>;

    /// Release the channel
    fn close(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// Opens connections to the instrument.
///
/// Must tolerate being called again after a failed attempt.
pub trait Connector {
    fn connect(
        &mut self,
        port: &str,
        channel: u8,
    ) -> Result<Box<dyn InstrumentConnection + '_>, ConnectionError>;
}
