pub mod analysis;
pub mod core;
pub mod index;
pub mod lifecycle;
pub mod query;
pub mod replication;
pub mod server;
pub mod storage;

/*
┌─────────────────────────────────────────────────────────────────────────────┐
│                          NGRAMDB STRUCT ARCHITECTURE                         │
└─────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────── CORE ───────────────────────────────────┐
│                                                                              │
│  ┌──────────────────────────────────────────────────────────────────────┐  │
│  │                          struct App (server)                          │  │
│  │  catalog: Arc<TableCatalog>        // name → TableContext             │  │
│  │  coordinator: Arc<LifecycleCoordinator> // SYNC/DUMP/OPTIMIZE gates   │  │
│  │  cache: Arc<CacheManager>          // QueryCache + InvalidationEngine │  │
│  │  invalidation: Arc<InvalidationQueue> // async ngram invalidation     │  │
│  │  executor: QueryExecutor           // AND/OR/NOT + filter + sort      │  │
│  │  apply_engine: Arc<BinlogApplyEngine> // binlog → (store, index)      │  │
│  │  sync_manager / dump_manager       // bulk load, snapshot codec       │  │
│  │  stats: Arc<ServerStats>           // shared by TCP and HTTP          │  │
│  └──────────────────────────────────────────────────────────────────────┘  │
│                                                                              │
│  ┌────────────────────┐  ┌────────────────────┐  ┌────────────────────┐    │
│  │ struct TableContext │  │ struct DocId       │  │ enum AttributeValue│    │
│  │ • index: Index      │  │ • 0: u32           │  │ • Null/Bool/ints   │    │
│  │ • store: DocStore   │  └────────────────────┘  │ • Str/F64          │    │
│  │ • latch: RwLock<()> │                          └────────────────────┘    │
│  └────────────────────┘                                                     │
└──────────────────────────────────────────────────────────────────────────────┘

┌─────────────────────────────────── INDEXING ────────────────────────────────┐
│                                                                              │
│  Index ──contains──> HashMap<Term, Arc<PostingList>>                         │
│    │                      PostingList: Delta(Vec<u32>) | Bitmap(Roaring)     │
│    ├──search_and/or/not   (merge join, batch-block probe, GetTopN paths)     │
│    └──optimize_in_batches (in-place strategy flips on shared handles)        │
│                                                                              │
│  NgramGenerator ──produces──> ascii n-grams + cjk n-grams + boundary runs    │
└──────────────────────────────────────────────────────────────────────────────┘

┌──────────────────────────────────── FLOW ───────────────────────────────────┐
│                                                                              │
│  query ──> CacheManager.lookup ──miss──> QueryExecutor ──> Index.search_and  │
│     ──> DocumentStore filters ──> ResultSorter ──> CacheManager.insert       │
│                                                                              │
│  binlog event ──> BinlogApplyEngine ──latch──> (store, index) mutation       │
│     ──> InvalidationQueue.enqueue ──batch──> CacheManager.invalidate_ngrams  │
│                                                                              │
│  LifecycleCoordinator gates SYNC / DUMP SAVE / DUMP LOAD / OPTIMIZE /        │
│  REPLICATION against each other with atomics + RAII guards                   │
└──────────────────────────────────────────────────────────────────────────────┘
*/
