// Copyright (c) 2026 Dawn Mesh
// Licensed under the Apache License, Version 2.0

#![forbid(unsafe_code)]

use dawn_mesh::core::config::RateLimitSection;
use dawn_mesh::core::types::NodeId;
use dawn_mesh::networking::rate_limit::RateLimiter;
use proptest::prelude::*;

proptest! {
    // The bucket for any node stays within [0, burst] across any sequence of
    // checks from any interleaving of nodes.
    #[test]
    fn tokens_stay_bounded(
        max_requests in 1u32..20,
        extra_burst in 0u32..20,
        calls in proptest::collection::vec(0u8..4, 1..200),
    ) {
        let burst = max_requests + extra_burst;
        let limiter = RateLimiter::new(RateLimitSection {
            max_requests,
            time_window: 0.5,
            burst,
        });
        for byte in calls {
            let node = NodeId::from_public_key(&[byte; 32]);
            let decision = limiter.check(&node);
            if !decision.allowed {
                prop_assert!(decision.retry_after > 0.0);
            }
            let tokens = limiter.tokens(&node).expect("bucket exists");
            prop_assert!(tokens >= 0.0);
            prop_assert!(tokens <= f64::from(burst));
        }
    }

    // A cold bucket grants exactly max_requests immediate calls.
    #[test]
    fn cold_bucket_grants_exactly_max_requests(max_requests in 1u32..30) {
        let limiter = RateLimiter::new(RateLimitSection {
            max_requests,
            time_window: 3600.0,
            burst: max_requests,
        });
        let node = NodeId::from_public_key(&[1u8; 32]);
        for _ in 0..max_requests {
            prop_assert!(limiter.check(&node).allowed);
        }
        prop_assert!(!limiter.check(&node).allowed);
    }
}
