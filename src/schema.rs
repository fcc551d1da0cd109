// Hand-maintained to match what `diesel print-schema` would emit for the
// migrations under `migrations/`. Kept in the same shape as the reference
// codebase's generated schema (`diesel::table!` blocks, explicit
// `joinable!`/`allow_tables_to_appear_in_same_query!`).

diesel::table! {
    campaigns (id) {
        id -> Uuid,
        world_id -> Uuid,
        owner_id -> Uuid,
        current_world_time -> Nullable<Int8>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
        archived_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    campaign_memberships (id) {
        id -> Uuid,
        campaign_id -> Uuid,
        user_id -> Uuid,
        role -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    branches (id) {
        id -> Uuid,
        campaign_id -> Uuid,
        parent_id -> Nullable<Uuid>,
        name -> Text,
        diverged_at -> Nullable<Int8>,
        is_pinned -> Bool,
        color -> Nullable<Text>,
        tags -> Array<Text>,
        created_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    versions (id) {
        id -> Uuid,
        entity_type -> Text,
        entity_id -> Uuid,
        branch_id -> Uuid,
        version -> Int4,
        valid_from -> Int8,
        valid_to -> Nullable<Int8>,
        payload_gz -> Bytea,
        created_by -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    audit_entries (id) {
        id -> Uuid,
        entity_type -> Text,
        entity_id -> Uuid,
        operation -> Text,
        user_id -> Uuid,
        changes -> Jsonb,
        metadata -> Nullable<Jsonb>,
        previous_state -> Nullable<Jsonb>,
        new_state -> Nullable<Jsonb>,
        diff -> Nullable<Jsonb>,
        reason -> Nullable<Text>,
        timestamp -> Timestamptz,
    }
}

diesel::table! {
    merge_history (id) {
        id -> Uuid,
        source_branch_id -> Uuid,
        target_branch_id -> Uuid,
        common_ancestor_id -> Uuid,
        world_time -> Int8,
        merged_by -> Uuid,
        merged_at -> Timestamptz,
        conflicts_count -> Int4,
        entities_merged -> Int4,
        resolutions_data -> Jsonb,
        metadata -> Nullable<Jsonb>,
    }
}

diesel::table! {
    state_variables (id) {
        id -> Uuid,
        scope -> Text,
        scope_id -> Nullable<Uuid>,
        key -> Text,
        var_type -> Text,
        value -> Nullable<Jsonb>,
        formula -> Nullable<Jsonb>,
        description -> Nullable<Text>,
        is_active -> Bool,
        version -> Int4,
        created_by -> Uuid,
        updated_by -> Nullable<Uuid>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    kingdoms (id) {
        id -> Uuid,
        campaign_id -> Uuid,
        name -> Text,
        variables -> Jsonb,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
        archived_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    settlements (id) {
        id -> Uuid,
        campaign_id -> Uuid,
        kingdom_id -> Uuid,
        name -> Text,
        population -> Int8,
        variables -> Jsonb,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
        archived_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    structures (id) {
        id -> Uuid,
        campaign_id -> Uuid,
        settlement_id -> Uuid,
        name -> Text,
        structure_type -> Text,
        variables -> Jsonb,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
        archived_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    parties (id) {
        id -> Uuid,
        campaign_id -> Uuid,
        name -> Text,
        variables -> Jsonb,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
        archived_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    characters (id) {
        id -> Uuid,
        campaign_id -> Uuid,
        party_id -> Nullable<Uuid>,
        name -> Text,
        variables -> Jsonb,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
        archived_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    locations (id) {
        id -> Uuid,
        world_id -> Uuid,
        name -> Text,
        variables -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
        archived_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    world_events (id) {
        id -> Uuid,
        campaign_id -> Uuid,
        name -> Text,
        variables -> Jsonb,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
        archived_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    encounters (id) {
        id -> Uuid,
        campaign_id -> Uuid,
        name -> Text,
        variables -> Jsonb,
        version -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
        archived_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(campaign_memberships -> campaigns (campaign_id));
diesel::joinable!(branches -> campaigns (campaign_id));
diesel::joinable!(kingdoms -> campaigns (campaign_id));
diesel::joinable!(settlements -> kingdoms (kingdom_id));
diesel::joinable!(structures -> settlements (settlement_id));
diesel::joinable!(parties -> campaigns (campaign_id));
diesel::joinable!(characters -> campaigns (campaign_id));
diesel::joinable!(world_events -> campaigns (campaign_id));
diesel::joinable!(encounters -> campaigns (campaign_id));

diesel::allow_tables_to_appear_in_same_query!(
    campaigns,
    campaign_memberships,
    branches,
    versions,
    audit_entries,
    merge_history,
    state_variables,
    kingdoms,
    settlements,
    structures,
    parties,
    characters,
    locations,
    world_events,
    encounters,
);
