// Wire type ids. These are the compatibility contract with deployed hubs:
// never renumber or reuse one.
use logbus_sof::SofConfiguration;

use crate::{
    AggregatedPatternData, AggregationKey, ChannelMessage, ChannelSubscriptionRequest,
    ChannelSubscriptionResponse, CompressedBlock, DefaultLogEvent, EventSubscriptionRequest,
    EventSubscriptionResponse, FilterRequest, HistoricalDataRequest, HistoricalDataResponse,
    HistoricalIndexElement, HistoricalIndexRequest, HistoricalIndexResponse, LogEventMessage,
    Result, SubscriptionRequest, SubscriptionResponse, UnsubscriptionRequest,
    UnsubscriptionResponse,
};

pub mod type_ids {
    pub const AGGREGATION_KEY: i32 = 4;
    pub const HISTORICAL_INDEX_ELEMENT: i32 = 5;
    pub const HISTORICAL_INDEX_REQUEST: i32 = 6;
    pub const HISTORICAL_INDEX_RESPONSE: i32 = 7;
    pub const DEFAULT_LOG_EVENT: i32 = 8;
    pub const HISTORICAL_DATA_REQUEST: i32 = 9;
    pub const HISTORICAL_DATA_RESPONSE: i32 = 10;
    pub const COMPRESSED_BLOCK: i32 = 11;
    pub const CHANNEL_MESSAGE: i32 = 12;
    pub const LOG_EVENT_MESSAGE: i32 = 13;
    pub const CHANNEL_SUBSCRIPTION_REQUEST: i32 = 14;
    pub const CHANNEL_SUBSCRIPTION_RESPONSE: i32 = 15;
    pub const EVENT_SUBSCRIPTION_REQUEST: i32 = 16;
    pub const EVENT_SUBSCRIPTION_RESPONSE: i32 = 17;
    // 22 and 23 belong to hub-side data structures that clients never decode.
    pub const RESERVED_DATA_STRUCTURE: i32 = 22;
    pub const RESERVED_DATA_ELEMENT: i32 = 23;
    pub const AGGREGATED_PATTERN_DATA: i32 = 24;
    pub const SUBSCRIPTION_REQUEST: i32 = 25;
    pub const SUBSCRIPTION_RESPONSE: i32 = 26;
    pub const UNSUBSCRIPTION_REQUEST: i32 = 27;
    pub const UNSUBSCRIPTION_RESPONSE: i32 = 28;
    pub const FILTER_REQUEST: i32 = 29;
}

/// The registry every logbus connection uses.
pub fn sof_configuration() -> Result<SofConfiguration> {
    use type_ids::*;

    Ok(SofConfiguration::builder()
        .register::<AggregationKey>(AGGREGATION_KEY)?
        .register::<HistoricalIndexElement>(HISTORICAL_INDEX_ELEMENT)?
        .register::<HistoricalIndexRequest>(HISTORICAL_INDEX_REQUEST)?
        .register::<HistoricalIndexResponse>(HISTORICAL_INDEX_RESPONSE)?
        .register::<DefaultLogEvent>(DEFAULT_LOG_EVENT)?
        .register::<HistoricalDataRequest>(HISTORICAL_DATA_REQUEST)?
        .register::<HistoricalDataResponse>(HISTORICAL_DATA_RESPONSE)?
        .register::<CompressedBlock>(COMPRESSED_BLOCK)?
        .register::<ChannelMessage>(CHANNEL_MESSAGE)?
        .register::<LogEventMessage>(LOG_EVENT_MESSAGE)?
        .register::<ChannelSubscriptionRequest>(CHANNEL_SUBSCRIPTION_REQUEST)?
        .register::<ChannelSubscriptionResponse>(CHANNEL_SUBSCRIPTION_RESPONSE)?
        .register::<EventSubscriptionRequest>(EVENT_SUBSCRIPTION_REQUEST)?
        .register::<EventSubscriptionResponse>(EVENT_SUBSCRIPTION_RESPONSE)?
        .register::<AggregatedPatternData>(AGGREGATED_PATTERN_DATA)?
        .register::<SubscriptionRequest>(SUBSCRIPTION_REQUEST)?
        .register::<SubscriptionResponse>(SUBSCRIPTION_RESPONSE)?
        .register::<UnsubscriptionRequest>(UNSUBSCRIPTION_REQUEST)?
        .register::<UnsubscriptionResponse>(UNSUBSCRIPTION_RESPONSE)?
        .register::<FilterRequest>(FILTER_REQUEST)?
        .build())
}
