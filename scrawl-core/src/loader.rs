use std::future::Future;

use hf_hub::api::tokio::Api;

use crate::device::DeviceMap;
use crate::weights::WeightLocations;
use crate::{PipelineLike, Result};

/// Startup seam: turns weight locations into a ready, GPU-resident pipeline.
/// Loading happens once per process; a failure here means the service cannot
/// start.
pub trait Loader {
    type Pipeline: PipelineLike;

    fn load(
        weights: WeightLocations,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = Result<Self::Pipeline>>
    where
        Self: Sized;
}
