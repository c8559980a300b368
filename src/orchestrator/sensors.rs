//! Sensor input port
//!
//! Location and heading acquisition live outside the core. A `SensorPort`
//! pushes readings into the orchestrator while scanning.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorReading {
    Location(GeoPoint),
    /// Fix lost; distances degrade to unknown
    LocationLost,
    /// Compass heading in degrees; non-positive means no live heading
    Heading(f64),
}

/// External location/heading feed
pub trait SensorPort: Send + Sync {
    fn start(&self, sink: mpsc::Sender<SensorReading>);
    fn stop(&self);
}

/// Feeds a fixed location and heading once per start
pub struct StaticSensor {
    location: Option<GeoPoint>,
    heading: Option<f64>,
    sink: Mutex<Option<mpsc::Sender<SensorReading>>>,
}

impl StaticSensor {
    pub fn new(location: Option<GeoPoint>, heading: Option<f64>) -> Self {
        Self {
            location,
            heading,
            sink: Mutex::new(None),
        }
    }

    /// No fixed readings; everything arrives through the control surface
    pub fn none() -> Self {
        Self::new(None, None)
    }
}

impl SensorPort for StaticSensor {
    fn start(&self, sink: mpsc::Sender<SensorReading>) {
        let readings = self
            .location
            .map(SensorReading::Location)
            .into_iter()
            .chain(self.heading.map(SensorReading::Heading));
        for reading in readings {
            if sink.try_send(reading).is_err() {
                debug!(?reading, "Sensor queue full, reading dropped");
            }
        }
        *self.sink.lock() = Some(sink);
    }

    fn stop(&self) {
        self.sink.lock().take();
    }
}
